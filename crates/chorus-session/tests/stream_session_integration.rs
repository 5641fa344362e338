//! Drives a full scripted session through the raw-frame path: init,
//! history restore, prompt submission, interleaved stage events across
//! two threads, and recovery after a transport drop.

use chorus_core::ClientFrame;
use chorus_session::{
    ConnectionStatus, SelectionStore, SessionController, SortKey, SubmitError, Turn,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct Harness {
    session: SessionController,
    outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SelectionStore::open(dir.path().join("state.json"));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (identity_tx, _identity_rx) = watch::channel(None);
        Self {
            session: SessionController::new(store, outbound_tx, identity_tx),
            outbound_rx,
            _dir: dir,
        }
    }

    fn outbound_kinds(&mut self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            kinds.push(frame.kind());
        }
        kinds
    }
}

const INIT_FRAME: &str = r#"{
    "type": "init",
    "user": {"id": "u-1", "public_key": "BASE58KEY"},
    "chat_threads": [
        {"id": "t-1", "user_id": "u-1", "name": "Chat 1", "messages": []},
        {"id": "t-2", "user_id": "u-1", "name": "Chat 2", "messages": []}
    ]
}"#;

#[test]
fn full_round_trip_over_raw_frames() {
    let mut harness = Harness::new();
    harness.session.connection_opened();
    harness.session.handle_frame(INIT_FRAME);
    assert_eq!(harness.session.selected_thread(), Some("t-1"));
    assert_eq!(harness.outbound_kinds(), vec!["get_thread_messages"]);

    harness.session.handle_frame(
        r#"{
            "type": "thread_messages",
            "thread_id": "t-1",
            "messages": [
                {"id": "m-1", "thread_id": "t-1", "role": "user", "content": "old question"},
                {"id": "m-2", "thread_id": "t-1", "role": "assistant", "content": "old answer", "step": "final"}
            ]
        }"#,
    );
    assert_eq!(harness.session.active_turns().len(), 2);

    harness.session.submit("new question").expect("submit");
    assert_eq!(harness.outbound_kinds(), vec!["prompt"]);

    // Interleaved pipeline, stages out of order, duplicates overwritten.
    harness
        .session
        .handle_frame(r#"{"step": "experience", "content": "recall", "sources": [
            {"id": "s-1", "content": "evidence", "similarity": 0.4},
            {"id": "s-2", "content": "stronger evidence", "similarity": 0.9}
        ]}"#);
    harness
        .session
        .handle_frame(r#"{"step": "action", "content": "first draft"}"#);
    harness
        .session
        .handle_frame(r#"{"step": "action", "content": "second draft"}"#);
    assert!(harness.session.is_streaming());

    harness.session.set_sort_key(SortKey::Similarity);
    let ranked = harness.session.ranked_sources();
    assert_eq!(ranked[0].id, "s-2");

    harness
        .session
        .handle_frame(r#"{"type": "chorus_response", "step": "final", "content": "the answer"}"#);
    assert!(!harness.session.is_streaming());

    let turns = harness.session.active_turns();
    assert_eq!(turns.len(), 4);
    let Turn::Assistant(turn) = &turns[3] else {
        panic!("expected assistant turn");
    };
    assert!(turn.is_complete);
    assert_eq!(turn.display_content(), Some("the answer"));
    let stage_names: Vec<_> = turn.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(stage_names, vec!["experience", "action", "final"]);

    // Late duplicate after final leaves the history untouched.
    harness
        .session
        .handle_frame(r#"{"step": "final", "content": "stale"}"#);
    let turns = harness.session.active_turns();
    let Turn::Assistant(turn) = &turns[3] else {
        panic!("expected assistant turn");
    };
    assert_eq!(turn.display_content(), Some("the answer"));
}

#[test]
fn stream_survives_thread_switch_and_transport_drop_ends_it() {
    let mut harness = Harness::new();
    harness.session.connection_opened();
    harness.session.handle_frame(INIT_FRAME);
    harness.outbound_kinds();

    harness.session.submit("slow question").expect("submit");
    harness
        .session
        .handle_frame(r#"{"step": "action", "content": "partial"}"#);

    harness.session.select_thread("t-2").expect("select");
    // Background stream keeps aggregating while t-2 is active.
    harness
        .session
        .handle_frame(r#"{"step": "observation", "content": "still thinking"}"#);

    // Transport drops mid-stream: the in-flight turn is closed out with
    // its partial content and the thread is usable again.
    harness.session.connection_closed();
    assert_eq!(harness.session.status(), ConnectionStatus::Closed);

    harness.session.select_thread("t-1").expect("select back");
    let turns = harness.session.active_turns();
    assert_eq!(turns.len(), 2);
    let Turn::Assistant(turn) = &turns[1] else {
        panic!("expected assistant turn");
    };
    assert!(turn.is_complete);
    assert_eq!(turn.stages.len(), 2);

    harness.session.connection_opened();
    assert!(harness.session.submit("retry").is_ok());
}

#[test]
fn selection_persists_across_controller_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("state.json");

    {
        let store = SelectionStore::open(&state_path);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let (identity_tx, _identity_rx) = watch::channel(None);
        let mut session = SessionController::new(store, outbound_tx, identity_tx);
        session.handle_frame(INIT_FRAME);
        session.select_thread("t-2").expect("select");
    }

    let store = SelectionStore::open(&state_path);
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let (identity_tx, _identity_rx) = watch::channel(None);
    let mut session = SessionController::new(store, outbound_tx, identity_tx);
    session.handle_frame(INIT_FRAME);
    assert_eq!(session.selected_thread(), Some("t-2"));
}

#[test]
fn error_frame_ends_stream_and_keeps_partial_turn() {
    let mut harness = Harness::new();
    harness.session.connection_opened();
    harness.session.handle_frame(INIT_FRAME);
    harness.outbound_kinds();

    harness.session.submit("doomed question").expect("submit");
    harness
        .session
        .handle_frame(r#"{"step": "action", "content": "partial"}"#);
    harness
        .session
        .handle_frame(r#"{"type": "error", "error": "pipeline failed"}"#);

    assert!(!harness.session.is_streaming());
    assert_eq!(
        harness.session.take_last_error().as_deref(),
        Some("pipeline failed")
    );
    assert_eq!(harness.session.active_turns().len(), 2);
    assert_eq!(harness.session.submit("try again"), Ok(()));
    assert_eq!(
        harness.session.submit("impatient"),
        Err(SubmitError::AlreadyStreaming)
    );
}
