//! Ranked view over the evidence batch surfaced by the `experience`
//! stage. Each new batch replaces the previous one wholesale; ranking is
//! a pure view and never mutates the stored order.

use chorus_core::Source;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    Similarity,
    CreatedAt,
    TokenValue,
    Role,
    ThreadId,
    /// Original server order, the client's default.
    #[default]
    Custom,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Similarity => "similarity",
            SortKey::CreatedAt => "date",
            SortKey::TokenValue => "tokens",
            SortKey::Role => "role",
            SortKey::ThreadId => "thread",
            SortKey::Custom => "custom",
        }
    }
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "similarity" => Ok(SortKey::Similarity),
            "date" | "created_at" | "recency" => Ok(SortKey::CreatedAt),
            "tokens" | "token_value" => Ok(SortKey::TokenValue),
            "role" => Ok(SortKey::Role),
            "thread" | "thread_id" => Ok(SortKey::ThreadId),
            "custom" => Ok(SortKey::Custom),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

#[derive(Debug, Default)]
pub struct SourceRanker {
    sources: Vec<Source>,
}

impl SourceRanker {
    pub fn set(&mut self, batch: Vec<Source>) {
        self.sources = batch;
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// A freshly ordered copy under the given key. Stable, so ties keep
    /// the server's original order; `Custom` is a no-op.
    pub fn ranked(&self, key: SortKey) -> Vec<Source> {
        let mut view = self.sources.clone();
        match key {
            SortKey::Similarity => view.sort_by(|a, b| {
                descending_f64(a.similarity.unwrap_or(0.0), b.similarity.unwrap_or(0.0))
            }),
            SortKey::CreatedAt => view.sort_by(|a, b| {
                b.created_at_utc()
                    .cmp(&a.created_at_utc())
            }),
            SortKey::TokenValue => view.sort_by(|a, b| {
                descending_f64(a.token_value.unwrap_or(0.0), b.token_value.unwrap_or(0.0))
            }),
            SortKey::Role => view.sort_by(|a, b| {
                a.role
                    .as_deref()
                    .unwrap_or_default()
                    .cmp(b.role.as_deref().unwrap_or_default())
            }),
            SortKey::ThreadId => view.sort_by(|a, b| {
                a.thread_id
                    .as_deref()
                    .unwrap_or_default()
                    .cmp(b.thread_id.as_deref().unwrap_or_default())
            }),
            SortKey::Custom => {}
        }
        view
    }
}

fn descending_f64(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}
