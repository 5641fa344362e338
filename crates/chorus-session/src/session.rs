//! The orchestrating façade over the registry, per-thread aggregators,
//! and source ranker. All state transitions happen here, one event at a
//! time: inbound frames, connection status changes, and user intents are
//! applied by the single task that owns the controller.

use crate::persist::SelectionStore;
use crate::sources::{SortKey, SourceRanker};
use crate::threads::{SelectError, ThreadRegistry};
use crate::turns::{StageOutcome, ThreadTurns, Turn};
use chorus_core::{decode_event, ChorusResponse, ClientFrame, ServerEvent, Source, StageName, User};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("prompt is empty")]
    EmptyInput,
    #[error("no active thread")]
    NoActiveThread,
    #[error("identity not established")]
    NoIdentity,
    #[error("a turn is already streaming for this thread")]
    AlreadyStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreateThreadError {
    #[error("identity not established")]
    NoIdentity,
    #[error("transport is not open")]
    NotConnected,
    #[error("a create request is already pending")]
    CreatePending,
}

/// Connection status as the session sees it. `Disconnected` is the
/// persistent state after the connection manager exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Open,
    Closed,
    Disconnected,
}

pub struct SessionController {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    identity_tx: watch::Sender<Option<String>>,
    store: SelectionStore,
    registry: ThreadRegistry,
    turns: HashMap<String, ThreadTurns>,
    ranker: SourceRanker,
    sort_key: SortKey,
    user: Option<User>,
    status: ConnectionStatus,
    /// Threads with an in-flight submission, in submit order. Chorus
    /// events that carry no thread id are attributed to the oldest
    /// binding, i.e. the thread that was active when its prompt went out.
    stream_bindings: VecDeque<String>,
    last_error: Option<String>,
}

impl SessionController {
    pub fn new(
        store: SelectionStore,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        identity_tx: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            outbound,
            identity_tx,
            store,
            registry: ThreadRegistry::default(),
            turns: HashMap::new(),
            ranker: SourceRanker::default(),
            sort_key: SortKey::default(),
            user: None,
            status: ConnectionStatus::default(),
            stream_bindings: VecDeque::new(),
            last_error: None,
        }
    }

    // ---- render view -----------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn selected_thread(&self) -> Option<&str> {
        self.registry.selected()
    }

    /// Ordered turns of the active thread.
    pub fn active_turns(&self) -> &[Turn] {
        self.registry
            .selected()
            .and_then(|id| self.turns.get(id))
            .map(ThreadTurns::turns)
            .unwrap_or_default()
    }

    pub fn thread_turns(&self, thread_id: &str) -> Option<&ThreadTurns> {
        self.turns.get(thread_id)
    }

    /// Whether the active thread has a turn mid-stream. A submitted
    /// prompt counts from the moment it goes out, not from the first
    /// stage event.
    pub fn is_streaming(&self) -> bool {
        self.registry
            .selected()
            .map(|id| self.thread_streaming(id))
            .unwrap_or(false)
    }

    fn thread_streaming(&self, thread_id: &str) -> bool {
        self.stream_bindings.iter().any(|bound| bound == thread_id)
            || self
                .turns
                .get(thread_id)
                .map(ThreadTurns::is_streaming)
                .unwrap_or(false)
    }

    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    pub fn set_sort_key(&mut self, key: SortKey) {
        self.sort_key = key;
    }

    pub fn ranked_sources(&self) -> Vec<Source> {
        self.ranker.ranked(self.sort_key)
    }

    pub fn take_last_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    // ---- user intents ----------------------------------------------------

    /// Announce (or replace) the wallet public key. The connection task
    /// watches this value and re-announces it once per connection.
    pub fn set_identity(&mut self, public_key: &str) {
        info!(public_key, "identity set");
        let _ = self.identity_tx.send(Some(public_key.to_string()));
    }

    /// Validate and submit a prompt for the active thread. On success the
    /// user turn is recorded locally right away and the thread streams
    /// until its `final` stage or an error.
    pub fn submit(&mut self, input: &str) -> Result<(), SubmitError> {
        let prompt = input.trim();
        if prompt.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        let thread_id = self
            .registry
            .selected()
            .ok_or(SubmitError::NoActiveThread)?
            .to_string();
        if self.user.is_none() {
            return Err(SubmitError::NoIdentity);
        }
        if self.thread_streaming(&thread_id) {
            return Err(SubmitError::AlreadyStreaming);
        }

        self.send_frame(ClientFrame::prompt(prompt, &thread_id));
        self.turns
            .entry(thread_id.clone())
            .or_default()
            .push_user_turn(&thread_id, prompt);
        self.stream_bindings.push_back(thread_id);
        Ok(())
    }

    /// Request a new thread from the server. Single-flight: rejected
    /// while a previous request awaits its `new_thread` confirmation.
    pub fn create_thread(&mut self) -> Result<(), CreateThreadError> {
        let user_id = match &self.user {
            Some(user) => user.id.clone(),
            None => return Err(CreateThreadError::NoIdentity),
        };
        if self.status != ConnectionStatus::Open {
            return Err(CreateThreadError::NotConnected);
        }
        if !self.registry.begin_create() {
            return Err(CreateThreadError::CreatePending);
        }
        let name = self.registry.next_thread_name();
        self.send_frame(ClientFrame::create_thread(user_id, name));
        Ok(())
    }

    /// Switch the active thread: requests the server history and
    /// persists the selection for the next session. Does not cancel any
    /// in-flight stream on the previous thread.
    pub fn select_thread(&mut self, thread_id: &str) -> Result<(), SelectError> {
        self.registry.select(thread_id)?;
        self.after_select(thread_id);
        Ok(())
    }

    fn after_select(&mut self, thread_id: &str) {
        // The history request refreshes the cache: its response replaces
        // the thread's turns wholesale (keeping a live streaming tail),
        // so nothing aggregated in the background is ever dropped here.
        self.send_frame(ClientFrame::thread_history(thread_id));
        if let Err(err) = self.store.remember_selection(thread_id) {
            warn!(thread_id, error = %err, "failed to persist thread selection");
        }
    }

    // ---- connection lifecycle --------------------------------------------

    pub fn connection_opened(&mut self) {
        self.status = ConnectionStatus::Open;
    }

    /// Transport loss: every in-flight turn is abandoned back to idle
    /// (partial content kept) so no thread stays streaming with nothing
    /// left to feed it.
    pub fn connection_closed(&mut self) {
        self.status = ConnectionStatus::Closed;
        self.stream_bindings.clear();
        for (thread_id, turns) in self.turns.iter_mut() {
            if turns.abandon_streaming() {
                warn!(thread_id = %thread_id, "stream abandoned on disconnect");
            }
        }
        self.registry.cancel_create();
    }

    pub fn connection_gave_up(&mut self) {
        self.connection_closed();
        self.status = ConnectionStatus::Disconnected;
    }

    // ---- inbound events --------------------------------------------------

    /// Decode and apply one raw inbound frame. Malformed or unknown
    /// frames are logged and dropped; they never disturb session state.
    pub fn handle_frame(&mut self, raw: &str) {
        match decode_event(raw) {
            Ok(event) => self.apply_event(event),
            Err(err) => warn!(error = %err, "dropping undecodable frame"),
        }
    }

    pub fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Chorus(chorus) => self.apply_chorus(chorus),
            ServerEvent::ThreadMessages(payload) => {
                debug!(thread_id = %payload.thread_id, count = payload.messages.len(), "thread history received");
                self.turns
                    .entry(payload.thread_id.clone())
                    .or_default()
                    .replace_from_messages(&payload.thread_id, &payload.messages);
            }
            ServerEvent::NewThread(payload) => {
                let id = self.registry.ingest_new_thread(payload.chat_thread);
                info!(thread_id = %id, "thread created");
                self.after_select(&id);
            }
            ServerEvent::Init(payload) => {
                info!(user_id = %payload.user.id, threads = payload.chat_threads.len(), "session initialized");
                self.user = Some(payload.user);
                let persisted = self.store.last_selected_thread().map(str::to_string);
                let selected = self
                    .registry
                    .ingest_snapshot(payload.chat_threads, persisted.as_deref());
                if let Some(thread_id) = selected {
                    self.send_frame(ClientFrame::thread_history(&thread_id));
                }
            }
            ServerEvent::Error(payload) => {
                warn!(error = %payload.error, "server reported error");
                self.last_error = Some(payload.error);
                if let Some(thread_id) = self.stream_bindings.pop_front() {
                    if let Some(turns) = self.turns.get_mut(&thread_id) {
                        turns.abandon_streaming();
                    }
                }
            }
        }
    }

    fn apply_chorus(&mut self, chorus: ChorusResponse) {
        let Some(step) = chorus.step.as_deref() else {
            debug!("chorus response without step; dropped");
            return;
        };
        let stage = StageName::new(step);

        if stage.carries_sources() {
            if let Some(sources) = chorus.sources {
                debug!(count = sources.len(), "sources replaced");
                self.ranker.set(sources);
            }
        }

        let Some(thread_id) = self.route_chorus_thread(chorus.thread_id.as_deref()) else {
            warn!(stage = %stage, "chorus event with no routable thread; dropped");
            return;
        };

        let content = chorus.content.unwrap_or_default();
        let outcome = self
            .turns
            .entry(thread_id.clone())
            .or_default()
            .apply_stage(&thread_id, stage, content);
        match outcome {
            StageOutcome::Completed => {
                debug!(thread_id = %thread_id, "turn complete");
                self.release_binding(&thread_id);
            }
            StageOutcome::Ignored => {
                debug!(thread_id = %thread_id, "late stage ignored");
            }
            StageOutcome::Recorded => {}
        }
    }

    /// Pick the thread a chorus event belongs to. Explicit `thread_id`
    /// wins; otherwise the oldest in-flight submission binding, then the
    /// active thread as a last resort.
    fn route_chorus_thread(&self, explicit: Option<&str>) -> Option<String> {
        if let Some(id) = explicit {
            return Some(id.to_string());
        }
        if let Some(id) = self.stream_bindings.front() {
            return Some(id.clone());
        }
        self.registry.selected().map(str::to_string)
    }

    fn release_binding(&mut self, thread_id: &str) {
        if let Some(position) = self
            .stream_bindings
            .iter()
            .position(|bound| bound == thread_id)
        {
            self.stream_bindings.remove(position);
        }
    }

    fn send_frame(&self, frame: ClientFrame) {
        let kind = frame.kind();
        if self.outbound.send(frame).is_err() {
            warn!(kind, "outbound channel closed; frame dropped");
        }
    }
}
