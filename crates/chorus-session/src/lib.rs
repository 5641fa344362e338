//! Session state for the chorus chat client: turn aggregation, thread
//! registry, source ranking, selection persistence, and the controller
//! that ties them to a live connection.

pub mod persist;
pub mod session;
pub mod sources;
pub mod threads;
pub mod turns;

pub use persist::{SelectionStore, SelectionStoreError, LAST_SELECTED_THREAD_KEY};
pub use session::{ConnectionStatus, CreateThreadError, SessionController, SubmitError};
pub use sources::{SortKey, SourceRanker};
pub use threads::{SelectError, ThreadRegistry};
pub use turns::{AssistantTurn, Stage, StageOutcome, ThreadTurns, Turn};
