//! In-process `Memory` test double.
//!
//! Each `MockMemory` owns its own state; construct one per test. Search uses
//! the same ranking as the SQLite store, so tests written against the mock
//! hold for the real backend.

use crate::search::{rank_by_recency, rank_by_similarity, similarity_query, Candidate};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use thoughtstore_types::context::Context;
use thoughtstore_types::error::{ThoughtError, ThoughtResult};
use thoughtstore_types::memory::{Memory, TaskFilter};
use thoughtstore_types::thought::{Note, ThoughtId, ThoughtRecord, TraceId};

struct StoredThought {
    seq: i64,
    record: ThoughtRecord,
}

#[derive(Default)]
struct MockState {
    thoughts: HashMap<ThoughtId, StoredThought>,
    retired: HashSet<ThoughtId>,
    next_seq: i64,
    fail_writes: bool,
}

/// Memory backed by a `HashMap`, for tests.
#[derive(Default)]
pub struct MockMemory {
    state: Mutex<MockState>,
}

impl MockMemory {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error (or stop doing so).
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    /// Number of stored thoughts.
    pub fn thought_count(&self) -> usize {
        self.state.lock().map(|s| s.thoughts.len()).unwrap_or(0)
    }

    fn lock(&self, ctx: &Context) -> ThoughtResult<MutexGuard<'_, MockState>> {
        ctx.check()?;
        self.state
            .lock()
            .map_err(|e| ThoughtError::Internal(e.to_string()))
    }

    fn lock_for_write(&self, ctx: &Context) -> ThoughtResult<MutexGuard<'_, MockState>> {
        let state = self.lock(ctx)?;
        if state.fail_writes {
            return Err(ThoughtError::Storage("mock write failure".into()));
        }
        Ok(state)
    }
}

impl MockState {
    fn candidates<'a>(
        &'a self,
        filter: Option<&'a TaskFilter>,
        embedded_only: bool,
    ) -> impl Iterator<Item = Candidate> + 'a {
        self.thoughts
            .values()
            .filter(move |t| match filter {
                None => true,
                Some(f) => {
                    f.trace_id.as_ref().map_or(true, |tr| *tr == t.record.trace_id)
                        && f.matches_intent(&t.record.intent)
                }
            })
            .flat_map(move |t| {
                t.record.notes.values().filter_map(move |note| {
                    if embedded_only && note.embedding.is_none() {
                        return None;
                    }
                    if let Some(source) = filter.and_then(|f| f.source.as_deref()) {
                        if note.source != source {
                            return None;
                        }
                    }
                    Some(Candidate {
                        seq: t.seq,
                        note: note.clone(),
                    })
                })
            })
    }
}

#[async_trait]
impl Memory for MockMemory {
    async fn create_thought(&self, ctx: &Context, thought: &ThoughtRecord) -> ThoughtResult<()> {
        thought.validate()?;
        let mut state = self.lock_for_write(ctx)?;
        if state.retired.contains(&thought.id) {
            return Err(ThoughtError::Storage(format!(
                "Thought ID {} belonged to a deleted thought",
                thought.id
            )));
        }
        if state.thoughts.contains_key(&thought.id) {
            return Err(ThoughtError::Storage(format!(
                "Thought already exists: {}",
                thought.id
            )));
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.thoughts.insert(
            thought.id,
            StoredThought {
                seq,
                record: thought.clone(),
            },
        );
        Ok(())
    }

    async fn get_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<ThoughtRecord> {
        let state = self.lock(ctx)?;
        state
            .thoughts
            .get(&id)
            .map(|t| t.record.clone())
            .ok_or_else(|| ThoughtError::ThoughtNotFound(id.to_string()))
    }

    async fn get_thought_by_trace_id(
        &self,
        ctx: &Context,
        trace_id: &TraceId,
    ) -> ThoughtResult<ThoughtRecord> {
        let state = self.lock(ctx)?;
        state
            .thoughts
            .values()
            .filter(|t| t.record.trace_id == *trace_id)
            .max_by_key(|t| t.seq)
            .map(|t| t.record.clone())
            .ok_or_else(|| ThoughtError::ThoughtNotFound(format!("trace {trace_id}")))
    }

    async fn delete_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<()> {
        let mut state = self.lock_for_write(ctx)?;
        if state.thoughts.remove(&id).is_none() {
            return Err(ThoughtError::ThoughtNotFound(id.to_string()));
        }
        state.retired.insert(id);
        Ok(())
    }

    async fn put_note(&self, ctx: &Context, note: &Note) -> ThoughtResult<()> {
        note.validate()?;
        let mut state = self.lock_for_write(ctx)?;
        let stored = state
            .thoughts
            .get_mut(&note.thought_id)
            .ok_or_else(|| ThoughtError::ThoughtNotFound(note.thought_id.to_string()))?;
        stored.record.upsert_note(note.clone())
    }

    async fn search_notes(
        &self,
        ctx: &Context,
        query: Option<&[f32]>,
        limit: usize,
    ) -> ThoughtResult<Vec<Note>> {
        let Some(query) = similarity_query(query, limit)? else {
            return Ok(Vec::new());
        };
        let state = self.lock(ctx)?;
        let candidates = state.candidates(None, true).collect();
        Ok(rank_by_similarity(query, candidates, limit))
    }

    async fn search_notes_by_task(
        &self,
        ctx: &Context,
        filter: Option<&TaskFilter>,
        limit: usize,
    ) -> ThoughtResult<Vec<Note>> {
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = similarity_query(filter.query_embedding.as_deref(), limit)?;
        let state = self.lock(ctx)?;
        let candidates = state.candidates(Some(filter), query.is_some()).collect();
        Ok(match query {
            Some(q) => rank_by_similarity(q, candidates, limit),
            None => rank_by_recency(candidates, limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use thoughtstore_types::thought::Thought;

    #[tokio::test]
    async fn test_nil_queries_return_empty() {
        let memory = Arc::new(MockMemory::new());
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, memory.clone(), "seed").await.unwrap();
        thought
            .set_content_with_embedding(&ctx, "k", "v", "s", vec![1.0])
            .await
            .unwrap();

        assert!(memory.search_notes(&ctx, None, 10).await.unwrap().is_empty());
        assert!(memory
            .search_notes_by_task(&ctx, None, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(memory
            .search_notes_by_task(&ctx, Some(&TaskFilter::default()), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_write_failure_keeps_state() {
        let memory = Arc::new(MockMemory::new());
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, memory.clone(), "fragile").await.unwrap();
        thought.set_content(&ctx, "k", "v1", "a").await.unwrap();

        memory.fail_writes(true);
        let err = thought.set_content(&ctx, "k", "v2", "b").await.unwrap_err();
        assert!(matches!(err, ThoughtError::Storage(_)));
        assert_eq!(thought.get_content("k").unwrap(), "v1");

        memory.fail_writes(false);
        let stored = memory.get_thought(&ctx, thought.id()).await.unwrap();
        assert_eq!(stored.notes["k"].value, "v1");
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let ctx = Context::background();
        let a = Arc::new(MockMemory::new());
        let b = MockMemory::new();
        let thought = Thought::new(&ctx, a.clone(), "only in a").await.unwrap();
        assert_eq!(a.thought_count(), 1);
        assert_eq!(b.thought_count(), 0);
        assert!(b.get_thought(&ctx, thought.id()).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_canceled_context() {
        let memory = MockMemory::new();
        let ctx = Context::background();
        ctx.cancel();
        let err = tokio_test::block_on(memory.get_thought(&ctx, ThoughtId::new())).unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));
    }
}
