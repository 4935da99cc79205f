//! Thought and note entities, plus the store-bound `Thought` handle.
//!
//! `ThoughtRecord` is plain data that backends persist and hydrate.
//! `Thought` pairs a record with the `Memory` it came from; note writes made
//! through the handle go to the store first and only then to the local copy,
//! so the two never diverge after a successful call.

use crate::context::Context;
use crate::error::{ThoughtError, ThoughtResult};
use crate::memory::Memory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for a thought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThoughtId(pub Uuid);

impl ThoughtId {
    /// Create a new random ThoughtId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ThoughtId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ThoughtId {
    type Err = ThoughtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ThoughtError::InvalidInput(format!("bad thought id '{s}': {e}")))
    }
}

/// Identifier correlating the thoughts of one logical execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a fresh trace ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use `raw` when non-blank, otherwise generate one.
    pub fn or_generate(raw: Option<String>) -> Self {
        match raw {
            Some(s) if !s.trim().is_empty() => Self(s),
            _ => Self::generate(),
        }
    }

    /// Borrow the trace ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TraceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TraceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A key/value annotation attached to a thought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// The owning thought.
    pub thought_id: ThoughtId,
    /// Unique within the owning thought.
    pub key: String,
    /// Payload.
    pub value: String,
    /// Which component wrote this note.
    pub source: String,
    /// Caller-supplied embedding used by similarity search.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// When this note was last written.
    pub updated_at: DateTime<Utc>,
}

impl Note {
    /// Build a note stamped with the current time.
    pub fn new(
        thought_id: ThoughtId,
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            thought_id,
            key: key.into(),
            value: value.into(),
            source: source.into(),
            embedding: None,
            updated_at: Utc::now(),
        }
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Reject blank keys and non-finite embedding components.
    pub fn validate(&self) -> ThoughtResult<()> {
        if self.key.trim().is_empty() {
            return Err(ThoughtError::InvalidInput("note key must not be blank".into()));
        }
        if let Some(ref embedding) = self.embedding {
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(ThoughtError::InvalidInput(format!(
                    "embedding for note '{}' contains non-finite values",
                    self.key
                )));
            }
        }
        Ok(())
    }
}

/// One reasoning step: identity, intent, trace, and its notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    /// Unique ID, assigned at creation.
    pub id: ThoughtId,
    /// What this thought is for.
    pub intent: String,
    /// Execution this thought belongs to.
    pub trace_id: TraceId,
    /// When this thought was created.
    pub created_at: DateTime<Utc>,
    /// Notes keyed by note key.
    #[serde(default)]
    pub notes: BTreeMap<String, Note>,
}

impl ThoughtRecord {
    /// Create a record with a fresh ID. A missing or blank trace is generated.
    pub fn new(intent: impl Into<String>, trace_id: Option<String>) -> ThoughtResult<Self> {
        let intent = intent.into();
        if intent.trim().is_empty() {
            return Err(ThoughtError::InvalidInput("intent must not be blank".into()));
        }
        Ok(Self {
            id: ThoughtId::new(),
            intent,
            trace_id: TraceId::or_generate(trace_id),
            created_at: Utc::now(),
            notes: BTreeMap::new(),
        })
    }

    /// Check the intent and every carried note before persisting.
    pub fn validate(&self) -> ThoughtResult<()> {
        if self.intent.trim().is_empty() {
            return Err(ThoughtError::InvalidInput("intent must not be blank".into()));
        }
        if self.trace_id.as_str().trim().is_empty() {
            return Err(ThoughtError::InvalidInput("trace id must not be blank".into()));
        }
        for (key, note) in &self.notes {
            if note.thought_id != self.id || &note.key != key {
                return Err(ThoughtError::InvalidInput(format!(
                    "note '{key}' is not owned by thought {}",
                    self.id
                )));
            }
            note.validate()?;
        }
        Ok(())
    }

    /// Insert or overwrite a note by key. The note must belong to this thought.
    pub fn upsert_note(&mut self, note: Note) -> ThoughtResult<()> {
        if note.thought_id != self.id {
            return Err(ThoughtError::InvalidInput(format!(
                "note '{}' belongs to thought {}, not {}",
                note.key, note.thought_id, self.id
            )));
        }
        note.validate()?;
        self.notes.insert(note.key.clone(), note);
        Ok(())
    }
}

/// A thought bound to the `Memory` that persists it.
pub struct Thought {
    record: ThoughtRecord,
    memory: Arc<dyn Memory>,
}

impl fmt::Debug for Thought {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thought")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Thought {
    /// Create and persist a new thought with a generated trace ID.
    pub async fn new(
        ctx: &Context,
        memory: Arc<dyn Memory>,
        intent: impl Into<String>,
    ) -> ThoughtResult<Self> {
        Self::create(ctx, memory, ThoughtRecord::new(intent, None)?).await
    }

    /// Create and persist a new thought under `trace_id`.
    pub async fn new_with_trace(
        ctx: &Context,
        memory: Arc<dyn Memory>,
        intent: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> ThoughtResult<Self> {
        Self::create(
            ctx,
            memory,
            ThoughtRecord::new(intent, Some(trace_id.into()))?,
        )
        .await
    }

    async fn create(
        ctx: &Context,
        memory: Arc<dyn Memory>,
        record: ThoughtRecord,
    ) -> ThoughtResult<Self> {
        memory.create_thought(ctx, &record).await?;
        debug!(id = %record.id, trace = %record.trace_id, "Created thought");
        Ok(Self { record, memory })
    }

    /// Load a hydrated thought by ID.
    pub async fn get(ctx: &Context, memory: Arc<dyn Memory>, id: ThoughtId) -> ThoughtResult<Self> {
        let record = memory.get_thought(ctx, id).await?;
        Ok(Self { record, memory })
    }

    /// Load the most recent hydrated thought for a trace.
    pub async fn get_by_trace_id(
        ctx: &Context,
        memory: Arc<dyn Memory>,
        trace_id: impl Into<TraceId>,
    ) -> ThoughtResult<Self> {
        let record = memory.get_thought_by_trace_id(ctx, &trace_id.into()).await?;
        Ok(Self { record, memory })
    }

    /// The thought's ID.
    pub fn id(&self) -> ThoughtId {
        self.record.id
    }

    /// The intent supplied at creation.
    pub fn intent(&self) -> &str {
        &self.record.intent
    }

    /// The trace this thought belongs to.
    pub fn trace_id(&self) -> &TraceId {
        &self.record.trace_id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// The underlying data.
    pub fn record(&self) -> &ThoughtRecord {
        &self.record
    }

    /// Store or overwrite a note, writing through to the memory first.
    pub async fn set_content(
        &mut self,
        ctx: &Context,
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
    ) -> ThoughtResult<()> {
        let note = Note::new(self.record.id, key, value, source);
        self.write_note(ctx, note).await
    }

    /// Like `set_content`, also storing an embedding for similarity search.
    pub async fn set_content_with_embedding(
        &mut self,
        ctx: &Context,
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
        embedding: Vec<f32>,
    ) -> ThoughtResult<()> {
        let note = Note::new(self.record.id, key, value, source).with_embedding(embedding);
        self.write_note(ctx, note).await
    }

    async fn write_note(&mut self, ctx: &Context, note: Note) -> ThoughtResult<()> {
        note.validate()?;
        self.memory.put_note(ctx, &note).await?;
        self.record.upsert_note(note)
    }

    /// Read a note's value from the hydrated note set.
    pub fn get_content(&self, key: &str) -> ThoughtResult<&str> {
        self.record
            .notes
            .get(key)
            .map(|n| n.value.as_str())
            .ok_or_else(|| ThoughtError::NoteNotFound(format!("{key} on thought {}", self.record.id)))
    }

    /// The full note, if present.
    pub fn note(&self, key: &str) -> Option<&Note> {
        self.record.notes.get(key)
    }

    /// Every hydrated note, ordered by key.
    pub fn all_notes(&self) -> Vec<&Note> {
        self.record.notes.values().collect()
    }

    /// Re-hydrate from the store, picking up writes made through other handles.
    pub async fn refresh(&mut self, ctx: &Context) -> ThoughtResult<()> {
        self.record = self.memory.get_thought(ctx, self.record.id).await?;
        Ok(())
    }

    /// Delete this thought and its notes from the store.
    pub async fn delete(self, ctx: &Context) -> ThoughtResult<()> {
        self.memory.delete_thought(ctx, self.record.id).await
    }
}
