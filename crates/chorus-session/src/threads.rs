//! Registry of known conversation threads and the active selection.
//!
//! Threads live for the lifetime of the session; there is no client-side
//! deletion. Creation is single-flight: one create request may be
//! outstanding at a time, and the thread only becomes selectable once the
//! server confirms it.

use chorus_core::ChatThread;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectError {
    #[error("unknown thread id: {0}")]
    UnknownThread(String),
}

#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Vec<ChatThread>,
    selected: Option<String>,
    create_pending: bool,
}

impl ThreadRegistry {
    pub fn threads(&self) -> &[ChatThread] {
        &self.threads
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected_thread(&self) -> Option<&ChatThread> {
        let id = self.selected.as_deref()?;
        self.get(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatThread> {
        self.threads.iter().find(|thread| thread.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn create_pending(&self) -> bool {
        self.create_pending
    }

    /// Default display name for the next thread, matching the original
    /// client's `Chat N` convention.
    pub fn next_thread_name(&self) -> String {
        format!("Chat {}", self.threads.len() + 1)
    }

    /// Mark a create request in flight. Returns false if one is already
    /// outstanding (the caller must not send a second request).
    pub fn begin_create(&mut self) -> bool {
        if self.create_pending {
            debug!("thread create already pending; ignoring");
            return false;
        }
        self.create_pending = true;
        true
    }

    /// Clear the pending flag without a confirmation, e.g. when the
    /// outbound request could not be sent.
    pub fn cancel_create(&mut self) {
        self.create_pending = false;
    }

    /// Full thread list from the `init` event. Selects the persisted
    /// thread if it survived, else the first thread, else nothing.
    /// Returns the resulting selection.
    pub fn ingest_snapshot(
        &mut self,
        threads: Vec<ChatThread>,
        persisted: Option<&str>,
    ) -> Option<String> {
        info!(count = threads.len(), "ingesting thread snapshot");
        self.threads = threads;

        let restored = persisted.filter(|id| self.contains(id));
        let fallback = self.threads.first().map(|thread| thread.id.as_str());
        self.selected = restored.or(fallback).map(str::to_string);
        if persisted.is_some() && restored.is_none() {
            warn!(persisted = persisted.unwrap_or_default(), "persisted thread missing from snapshot");
        }
        self.selected.clone()
    }

    /// Server confirmation of a create request. The new thread is
    /// appended and immediately becomes the active thread.
    pub fn ingest_new_thread(&mut self, thread: ChatThread) -> String {
        let id = thread.id.clone();
        if self.contains(&id) {
            debug!(thread_id = %id, "duplicate new_thread confirmation");
        } else {
            self.threads.push(thread);
        }
        self.create_pending = false;
        self.selected = Some(id.clone());
        id
    }

    pub fn select(&mut self, id: &str) -> Result<(), SelectError> {
        if !self.contains(id) {
            return Err(SelectError::UnknownThread(id.to_string()));
        }
        self.selected = Some(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn thread(id: &str) -> ChatThread {
        ChatThread {
            id: id.to_string(),
            user_id: "u-1".to_string(),
            name: format!("Chat {id}"),
            created_at: None,
            messages: Vec::new(),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn snapshot_restores_persisted_selection_when_present() {
        let mut registry = ThreadRegistry::default();
        let selected =
            registry.ingest_snapshot(vec![thread("t-1"), thread("t-2")], Some("t-2"));
        assert_eq!(selected.as_deref(), Some("t-2"));
        assert_eq!(registry.selected(), Some("t-2"));
    }

    #[test]
    fn snapshot_falls_back_to_first_thread_then_empty() {
        let mut registry = ThreadRegistry::default();
        let selected = registry.ingest_snapshot(vec![thread("t-1"), thread("t-2")], Some("gone"));
        assert_eq!(selected.as_deref(), Some("t-1"));

        let selected = registry.ingest_snapshot(Vec::new(), Some("t-1"));
        assert_eq!(selected, None);
        assert_eq!(registry.selected(), None);
    }

    #[test]
    fn create_is_single_flight_until_confirmation() {
        let mut registry = ThreadRegistry::default();
        assert!(registry.begin_create());
        assert!(!registry.begin_create());
        assert!(registry.create_pending());

        let id = registry.ingest_new_thread(thread("t-9"));
        assert_eq!(id, "t-9");
        assert!(!registry.create_pending());
        assert_eq!(registry.selected(), Some("t-9"));

        // A new request may start once confirmed.
        assert!(registry.begin_create());
        registry.cancel_create();
        assert!(!registry.create_pending());
    }

    #[test]
    fn select_rejects_unknown_ids() {
        let mut registry = ThreadRegistry::default();
        registry.ingest_snapshot(vec![thread("t-1")], None);
        assert_eq!(
            registry.select("t-404"),
            Err(SelectError::UnknownThread("t-404".to_string()))
        );
        assert_eq!(registry.selected(), Some("t-1"));
        assert!(registry.select("t-1").is_ok());
    }

    #[test]
    fn duplicate_new_thread_confirmation_does_not_duplicate_entry() {
        let mut registry = ThreadRegistry::default();
        registry.ingest_new_thread(thread("t-1"));
        registry.ingest_new_thread(thread("t-1"));
        assert_eq!(registry.threads().len(), 1);
    }

    #[test]
    fn next_thread_name_counts_existing_threads() {
        let mut registry = ThreadRegistry::default();
        assert_eq!(registry.next_thread_name(), "Chat 1");
        registry.ingest_snapshot(vec![thread("t-1"), thread("t-2")], None);
        assert_eq!(registry.next_thread_name(), "Chat 3");
    }
}
