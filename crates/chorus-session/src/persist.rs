//! Durable client-side state: the last selected thread, read at init and
//! written on every successful selection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const LAST_SELECTED_THREAD_KEY: &str = "last_selected_thread";

#[derive(Debug, Error)]
pub enum SelectionStoreError {
    #[error("state write failed: {0}")]
    Io(#[from] io::Error),
    #[error("state serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClientState {
    #[serde(default)]
    last_selected_thread: Option<String>,
    #[serde(default, flatten)]
    extra: HashMap<String, Value>,
}

/// JSON state file keeping the active-thread selection across sessions.
/// A missing or corrupt file degrades to "no selection"; reads never
/// fail the caller.
#[derive(Debug)]
pub struct SelectionStore {
    path: PathBuf,
    state: ClientState,
}

impl SelectionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt client state; starting fresh");
                    ClientState::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => ClientState::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "client state unreadable; starting fresh");
                ClientState::default()
            }
        };
        Self { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_selected_thread(&self) -> Option<&str> {
        self.state.last_selected_thread.as_deref()
    }

    pub fn remember_selection(&mut self, thread_id: &str) -> Result<(), SelectionStoreError> {
        self.state.last_selected_thread = Some(thread_id.to_string());
        self.flush()
    }

    fn flush(&self) -> Result<(), SelectionStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.state)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}
