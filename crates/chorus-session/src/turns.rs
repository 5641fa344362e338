//! Folds interleaved stage events into discrete conversation turns.
//!
//! Each thread runs an independent two-state machine: `Idle` until the
//! first stage event arrives, `Streaming` while stages accumulate, back
//! to `Idle` on the `final` stage or on a server error. Stage merges are
//! last-write-wins per stage name; the backend resends full stage
//! content, not deltas.

use chorus_core::{MessageRole, StageName, WireMessage};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

/// One named stage of an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: StageName,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTurn {
    pub id: String,
    pub thread_id: String,
    /// Stages in first-arrival order. Replacements keep their slot.
    pub stages: Vec<Stage>,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
}

impl AssistantTurn {
    fn new(thread_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            stages: Vec::new(),
            is_complete: false,
            created_at: Utc::now(),
        }
    }

    pub fn stage(&self, name: &StageName) -> Option<&Stage> {
        self.stages.iter().find(|stage| &stage.name == name)
    }

    /// The text to render for this turn: the final stage once complete,
    /// otherwise the most recently written stage.
    pub fn display_content(&self) -> Option<&str> {
        if self.is_complete {
            return self
                .stage(&StageName::new(StageName::FINAL))
                .map(|stage| stage.content.as_str());
        }
        self.stages.last().map(|stage| stage.content.as_str())
    }

    fn upsert_stage(&mut self, name: StageName, content: String) {
        match self.stages.iter_mut().find(|stage| stage.name == name) {
            Some(existing) => existing.content = content,
            None => self.stages.push(Stage { name, content }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User {
        id: String,
        thread_id: String,
        content: String,
        created_at: DateTime<Utc>,
    },
    Assistant(AssistantTurn),
}

impl Turn {
    pub fn id(&self) -> &str {
        match self {
            Turn::User { id, .. } => id,
            Turn::Assistant(turn) => &turn.id,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Turn::Assistant(turn) if !turn.is_complete)
    }
}

/// What applying a stage event did to the thread's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage recorded; the assistant turn is still streaming.
    Recorded,
    /// The `final` stage landed; the turn is complete.
    Completed,
    /// No in-flight turn accepts this stage (late duplicate after
    /// `final`); the event was dropped.
    Ignored,
}

/// Per-thread turn history and streaming state.
#[derive(Debug, Default)]
pub struct ThreadTurns {
    turns: Vec<Turn>,
    /// Index into `turns` of the in-flight assistant turn, if any.
    streaming_at: Option<usize>,
}

impl ThreadTurns {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_at.is_some()
    }

    /// Optimistic local record of a submitted prompt. Never rolled back.
    /// Returns the locally minted turn id.
    pub fn push_user_turn(&mut self, thread_id: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.turns.push(Turn::User {
            id: id.clone(),
            thread_id: thread_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        });
        id
    }

    /// Apply one stage event. Creates the assistant turn lazily on the
    /// first stage received while idle.
    pub fn apply_stage(&mut self, thread_id: &str, name: StageName, content: String) -> StageOutcome {
        let index = match self.streaming_at {
            Some(index) => index,
            None => {
                if name.is_final() && self.last_turn_completed() {
                    // Late duplicate for an already-terminated turn.
                    debug!(thread_id, stage = %name, "dropping stage after final");
                    return StageOutcome::Ignored;
                }
                self.turns
                    .push(Turn::Assistant(AssistantTurn::new(thread_id)));
                let index = self.turns.len() - 1;
                self.streaming_at = Some(index);
                index
            }
        };

        let Some(Turn::Assistant(turn)) = self.turns.get_mut(index) else {
            warn!(thread_id, index, "streaming index does not point at an assistant turn");
            self.streaming_at = None;
            return StageOutcome::Ignored;
        };

        let finished = name.is_final();
        turn.upsert_stage(name, content);
        if finished {
            turn.is_complete = true;
            self.streaming_at = None;
            StageOutcome::Completed
        } else {
            StageOutcome::Recorded
        }
    }

    /// Abandon the in-flight turn, keeping partial content. Used on
    /// server-reported errors and transport loss so the thread never
    /// stays streaming without a path back to idle.
    pub fn abandon_streaming(&mut self) -> bool {
        match self.streaming_at.take() {
            Some(index) => {
                if let Some(Turn::Assistant(turn)) = self.turns.get_mut(index) {
                    turn.is_complete = true;
                }
                true
            }
            None => false,
        }
    }

    /// Replace the cached history with server-confirmed messages, folding
    /// stored step messages back into assistant turns.
    ///
    /// An in-flight turn is not part of the stored history yet (the
    /// server commits messages after the run completes), so a streaming
    /// tail (the prompting user turn and the partial assistant turn)
    /// is carried over instead of dropped.
    pub fn replace_from_messages(&mut self, thread_id: &str, messages: &[WireMessage]) {
        let tail = self.detach_streaming_tail();
        self.turns.clear();
        self.streaming_at = None;

        for message in messages {
            match message.role {
                MessageRole::User => {
                    self.turns.push(Turn::User {
                        id: message
                            .id
                            .clone()
                            .unwrap_or_else(|| Uuid::new_v4().to_string()),
                        thread_id: thread_id.to_string(),
                        content: message.content.clone(),
                        created_at: parse_created_at(message.created_at.as_deref()),
                    });
                }
                MessageRole::Assistant => {
                    let name = message
                        .step
                        .as_deref()
                        .map(StageName::new)
                        .unwrap_or_else(|| StageName::new(StageName::FINAL));
                    let outcome = self.apply_stage(thread_id, name, message.content.clone());
                    if outcome == StageOutcome::Ignored {
                        warn!(thread_id, "stored step message dropped during history fold");
                    }
                }
                MessageRole::System => {}
            }
        }
        // Stored histories may end mid-run; do not leave the thread
        // looking live for a stream that is long gone.
        self.abandon_streaming();

        if !tail.is_empty() {
            let streaming_index = self.turns.len() + tail.len() - 1;
            self.turns.extend(tail);
            self.streaming_at = Some(streaming_index);
        }
    }

    /// Remove and return the live tail: the streaming assistant turn and
    /// the user turn that prompted it, when one directly precedes it.
    fn detach_streaming_tail(&mut self) -> Vec<Turn> {
        let Some(index) = self.streaming_at.take() else {
            return Vec::new();
        };
        let keep_from = match index.checked_sub(1) {
            Some(prev) if matches!(self.turns.get(prev), Some(Turn::User { .. })) => prev,
            _ => index,
        };
        self.turns.split_off(keep_from)
    }

    fn last_turn_completed(&self) -> bool {
        matches!(
            self.turns.last(),
            Some(Turn::Assistant(turn)) if turn.is_complete
        )
    }
}

fn parse_created_at(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> StageName {
        StageName::new(name)
    }

    #[test]
    fn stages_accumulate_in_arrival_order_until_final() {
        let mut thread = ThreadTurns::default();
        assert_eq!(
            thread.apply_stage("t-1", stage("action"), "draft".into()),
            StageOutcome::Recorded
        );
        assert_eq!(
            thread.apply_stage("t-1", stage("experience"), "recall".into()),
            StageOutcome::Recorded
        );
        assert!(thread.is_streaming());

        assert_eq!(
            thread.apply_stage("t-1", stage("final"), "answer".into()),
            StageOutcome::Completed
        );
        assert!(!thread.is_streaming());

        let Turn::Assistant(turn) = &thread.turns()[0] else {
            panic!("expected assistant turn");
        };
        let names: Vec<_> = turn.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["action", "experience", "final"]);
        assert!(turn.is_complete);
        assert_eq!(turn.display_content(), Some("answer"));
    }

    #[test]
    fn duplicate_stage_overwrites_in_place() {
        let mut thread = ThreadTurns::default();
        thread.apply_stage("t-1", stage("action"), "A".into());
        thread.apply_stage("t-1", stage("observation"), "O".into());
        thread.apply_stage("t-1", stage("action"), "B".into());

        let Turn::Assistant(turn) = &thread.turns()[0] else {
            panic!("expected assistant turn");
        };
        assert_eq!(turn.stages.len(), 2);
        assert_eq!(turn.stage(&stage("action")).unwrap().content, "B");
        // Replacement keeps the original slot.
        assert_eq!(turn.stages[0].name.as_str(), "action");
    }

    #[test]
    fn stages_after_final_are_ignored() {
        let mut thread = ThreadTurns::default();
        thread.apply_stage("t-1", stage("action"), "A".into());
        thread.apply_stage("t-1", stage("final"), "done".into());

        let before = thread.turns().to_vec();
        assert_eq!(
            thread.apply_stage("t-1", stage("final"), "late".into()),
            StageOutcome::Ignored
        );
        assert_eq!(thread.turns(), &before[..]);
    }

    #[test]
    fn non_final_stage_after_final_starts_a_new_turn() {
        let mut thread = ThreadTurns::default();
        thread.apply_stage("t-1", stage("action"), "A".into());
        thread.apply_stage("t-1", stage("final"), "done".into());

        // A fresh run begins lazily on the next non-final stage.
        assert_eq!(
            thread.apply_stage("t-1", stage("action"), "next run".into()),
            StageOutcome::Recorded
        );
        assert_eq!(thread.turns().len(), 2);
        assert!(thread.is_streaming());
    }

    #[test]
    fn error_abandons_in_flight_turn_keeping_partial_content() {
        let mut thread = ThreadTurns::default();
        thread.push_user_turn("t-1", "hello");
        thread.apply_stage("t-1", stage("action"), "partial".into());
        assert!(thread.is_streaming());

        assert!(thread.abandon_streaming());
        assert!(!thread.is_streaming());

        let Turn::Assistant(turn) = &thread.turns()[1] else {
            panic!("expected assistant turn");
        };
        assert_eq!(turn.stage(&stage("action")).unwrap().content, "partial");

        // Idempotent once idle.
        assert!(!thread.abandon_streaming());
    }

    #[test]
    fn user_turns_keep_insertion_order() {
        let mut thread = ThreadTurns::default();
        thread.push_user_turn("t-1", "first");
        thread.apply_stage("t-1", stage("final"), "reply".into());
        thread.push_user_turn("t-1", "second");

        let ids: Vec<_> = thread.turns().iter().map(|turn| turn.id().to_string()).collect();
        assert_eq!(ids.len(), 3);
        assert!(matches!(thread.turns()[0], Turn::User { ref content, .. } if content == "first"));
        assert!(matches!(thread.turns()[2], Turn::User { ref content, .. } if content == "second"));
    }

    #[test]
    fn history_fold_rebuilds_turns_from_stored_messages() {
        use chorus_core::WireMessage;
        use std::collections::HashMap;

        let message = |role: MessageRole, content: &str, step: Option<&str>| WireMessage {
            id: None,
            thread_id: Some("t-1".to_string()),
            role,
            content: content.to_string(),
            created_at: Some("2026-08-01T12:00:00Z".to_string()),
            step: step.map(str::to_string),
            extra: HashMap::new(),
        };

        let mut thread = ThreadTurns::default();
        thread.replace_from_messages(
            "t-1",
            &[
                message(MessageRole::User, "question", None),
                message(MessageRole::Assistant, "draft", Some("action")),
                message(MessageRole::Assistant, "answer", Some("final")),
                message(MessageRole::User, "follow-up", None),
                message(MessageRole::Assistant, "cut off", Some("action")),
            ],
        );

        assert_eq!(thread.turns().len(), 4);
        assert!(!thread.is_streaming());
        let Turn::Assistant(last) = &thread.turns()[3] else {
            panic!("expected assistant turn");
        };
        // Truncated run is closed out rather than left live.
        assert!(last.is_complete);
    }

    #[test]
    fn history_fold_keeps_the_streaming_tail() {
        use chorus_core::WireMessage;
        use std::collections::HashMap;

        let mut thread = ThreadTurns::default();
        thread.push_user_turn("t-1", "live question");
        thread.apply_stage("t-1", stage("action"), "live partial".into());
        assert!(thread.is_streaming());

        thread.replace_from_messages(
            "t-1",
            &[WireMessage {
                id: Some("m-1".to_string()),
                thread_id: Some("t-1".to_string()),
                role: MessageRole::User,
                content: "stored question".to_string(),
                created_at: None,
                step: None,
                extra: HashMap::new(),
            }],
        );

        // Stored history first, then the carried-over live tail.
        assert_eq!(thread.turns().len(), 3);
        assert!(thread.is_streaming());
        assert!(
            matches!(&thread.turns()[1], Turn::User { content, .. } if content == "live question")
        );

        // The carried-over turn still accepts stages.
        assert_eq!(
            thread.apply_stage("t-1", stage("final"), "answer".into()),
            StageOutcome::Completed
        );
        let Turn::Assistant(turn) = &thread.turns()[2] else {
            panic!("expected assistant turn");
        };
        assert_eq!(turn.stage(&stage("action")).unwrap().content, "live partial");
        assert!(turn.is_complete);
    }
}
