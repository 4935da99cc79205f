//! The `Memory` capability and its search filter.

use crate::context::Context;
use crate::error::ThoughtResult;
use crate::thought::{Note, ThoughtId, ThoughtRecord, TraceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Filter scoping a note search to thoughts belonging to one task.
///
/// Every criterion that is set must match. A filter with no criteria is a
/// trivial query and yields no notes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Only notes on thoughts with exactly this trace ID.
    pub trace_id: Option<TraceId>,
    /// Only notes on thoughts whose intent contains this text (ASCII case-insensitive).
    pub intent_contains: Option<String>,
    /// Only notes written by this source.
    pub source: Option<String>,
    /// Rank matching notes by similarity to this vector instead of recency.
    pub query_embedding: Option<Vec<f32>>,
}

impl TaskFilter {
    /// Create a filter for a specific trace.
    pub fn trace(trace_id: impl Into<TraceId>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Default::default()
        }
    }

    /// Create a filter matching thought intents.
    pub fn intent(text: impl Into<String>) -> Self {
        Self {
            intent_contains: Some(text.into()),
            ..Default::default()
        }
    }

    /// Restrict to notes from one source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Rank by similarity to `embedding`.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    /// True when no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none()
            && self.intent_contains.as_deref().map_or(true, str::is_empty)
            && self.source.is_none()
            && self
                .query_embedding
                .as_deref()
                .map_or(true, <[f32]>::is_empty)
    }

    /// ASCII case-insensitive intent match used by in-process backends.
    pub fn matches_intent(&self, intent: &str) -> bool {
        match self.intent_contains.as_deref() {
            None | Some("") => true,
            Some(needle) => intent
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
        }
    }
}

/// The storage and retrieval capability over thoughts and notes.
///
/// Implementations must hydrate thoughts completely (the thought and its whole
/// note set in one logical read) and apply note writes atomically.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Persist a new thought row together with any notes it already carries.
    async fn create_thought(&self, ctx: &Context, thought: &ThoughtRecord) -> ThoughtResult<()>;

    /// Load a thought and all of its notes.
    async fn get_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<ThoughtRecord>;

    /// Load the most recently created thought carrying `trace_id`.
    async fn get_thought_by_trace_id(
        &self,
        ctx: &Context,
        trace_id: &TraceId,
    ) -> ThoughtResult<ThoughtRecord>;

    /// Remove a thought and all of its notes. Missing IDs fail with not-found.
    async fn delete_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<()>;

    /// Insert or overwrite one note, keyed by `(note.thought_id, note.key)`.
    async fn put_note(&self, ctx: &Context, note: &Note) -> ThoughtResult<()>;

    /// Similarity search over note embeddings, best match first.
    async fn search_notes(
        &self,
        ctx: &Context,
        query: Option<&[f32]>,
        limit: usize,
    ) -> ThoughtResult<Vec<Note>>;

    /// Search restricted to notes on thoughts matching `filter`.
    async fn search_notes_by_task(
        &self,
        ctx: &Context,
        filter: Option<&TaskFilter>,
        limit: usize,
    ) -> ThoughtResult<Vec<Note>>;
}
