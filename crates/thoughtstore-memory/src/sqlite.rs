//! SQLite relational store for thoughts and notes.
//!
//! Thoughts map to one `thoughts` row each; notes map to `notes` rows keyed
//! by `(thought_id, key)`. Hydrating reads run inside one transaction so a
//! thought is never observed without its notes, and every write commits or
//! rolls back as a unit.
//!
//! All statements run on a blocking thread. While a statement runs, a
//! progress handler polls the caller's `Context` and interrupts SQLite once
//! it is done; writes also re-check the context right before `COMMIT`.

use crate::migration::run_migrations;
use crate::search::{
    embedding_from_bytes, embedding_to_bytes, rank_by_recency, rank_by_similarity,
    similarity_query, Candidate,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction, TransactionBehavior,
};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thoughtstore_types::config::StoreConfig;
use thoughtstore_types::context::Context;
use thoughtstore_types::error::{ThoughtError, ThoughtResult};
use thoughtstore_types::memory::{Memory, TaskFilter};
use thoughtstore_types::thought::{Note, ThoughtId, ThoughtRecord, TraceId};
use tracing::{debug, info, warn};

/// SQLite virtual-machine steps between cancellation checks.
const PROGRESS_OPS: i32 = 1_000;

const THOUGHT_COLUMNS: &str = "id, intent, trace_id, created_at";

/// Thought store backed by SQLite.
#[derive(Clone)]
pub struct SqliteMemory {
    conn: Arc<Mutex<Connection>>,
    read_retries: u32,
}

impl SqliteMemory {
    /// Open the database named by `config.database_url`, creating and migrating it as needed.
    pub fn open(config: &StoreConfig) -> ThoughtResult<Self> {
        let conn = open_connection(&config.database_url).map_err(|e| {
            ThoughtError::Storage(format!("cannot open '{}': {e}", config.database_url))
        })?;
        let store = Self::with_connection(conn, config)?;
        info!(url = %config.database_url, "Opened thought store");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> ThoughtResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn, &StoreConfig::with_url(":memory:"))
    }

    /// Open the database named by `THOUGHTSTORE_DATABASE_URL`.
    pub fn from_env() -> ThoughtResult<Self> {
        Self::open(&StoreConfig::from_env()?)
    }

    /// Configure and migrate an already-open connection.
    pub fn with_connection(conn: Connection, config: &StoreConfig) -> ThoughtResult<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(sql_err)?;
        if !is_memory_url(&config.database_url) {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
                .map_err(sql_err)?;
        }
        run_migrations(&conn).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            read_retries: config.read_retries,
        })
    }

    /// Run `f` against the connection on a blocking thread, bound to `ctx`.
    async fn run<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> ThoughtResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Context) -> ThoughtResult<T> + Send + 'static,
    {
        ctx.check()?;
        let conn = Arc::clone(&self.conn);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| {
                warn!(op, "Recovering connection after a panicked operation");
                conn.clear_poison();
                poisoned.into_inner()
            });
            if !guard.is_autocommit() {
                guard.execute_batch("ROLLBACK").map_err(sql_err)?;
            }
            ctx.check()?;
            let watch = AssertUnwindSafe(ctx.clone());
            guard.progress_handler(PROGRESS_OPS, Some(move || watch.is_done()));
            let result = f(&mut *guard, &ctx);
            guard.progress_handler(0, None::<fn() -> bool>);
            if let Err(ref e) = result {
                debug!(op, error = %e, "SQLite operation failed");
            }
            result
        })
        .await
        .map_err(|e| ThoughtError::Internal(format!("{op}: blocking task failed: {e}")))?
    }

    /// Like `run`, retrying on a busy database. Only for reads.
    async fn run_read<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> ThoughtResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection, &Context) -> ThoughtResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;
        loop {
            let call = Arc::clone(&f);
            match self.run(ctx, op, move |conn, ctx| call(conn, ctx)).await {
                Err(e) if e.is_transient() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "Database busy, retrying read");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Memory for SqliteMemory {
    async fn create_thought(&self, ctx: &Context, thought: &ThoughtRecord) -> ThoughtResult<()> {
        thought.validate()?;
        let record = thought.clone();
        self.run(ctx, "create_thought", move |conn, ctx| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err)?;
            let id = record.id.to_string();

            let retired: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM retired_thoughts WHERE id = ?1)",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            if retired {
                return Err(ThoughtError::Storage(format!(
                    "Thought ID {id} belonged to a deleted thought"
                )));
            }

            let seq: i64 = tx
                .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM thoughts", [], |row| {
                    row.get(0)
                })
                .map_err(sql_err)?;
            tx.execute(
                "INSERT INTO thoughts (id, seq, intent, trace_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id,
                    seq,
                    record.intent,
                    record.trace_id.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => {
                    ThoughtError::Storage(format!("Thought already exists: {id}"))
                }
                _ => sql_err(e),
            })?;

            for note in record.notes.values() {
                upsert_note(&tx, note)?;
            }

            commit_unless_done(tx, ctx)?;
            debug!(id = %record.id, seq, notes = record.notes.len(), "Stored thought");
            Ok(())
        })
        .await
    }

    async fn get_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<ThoughtRecord> {
        self.run_read(ctx, "get_thought", move |conn, _| {
            let tx = conn.transaction().map_err(sql_err)?;
            let record = load_thought(
                &tx,
                &format!("SELECT {THOUGHT_COLUMNS} FROM thoughts WHERE id = ?1"),
                &id.to_string(),
            )?
            .ok_or_else(|| ThoughtError::ThoughtNotFound(id.to_string()))?;
            tx.commit().map_err(sql_err)?;
            Ok(record)
        })
        .await
    }

    async fn get_thought_by_trace_id(
        &self,
        ctx: &Context,
        trace_id: &TraceId,
    ) -> ThoughtResult<ThoughtRecord> {
        let trace_id = trace_id.clone();
        self.run_read(ctx, "get_thought_by_trace_id", move |conn, _| {
            let tx = conn.transaction().map_err(sql_err)?;
            let record = load_thought(
                &tx,
                &format!(
                    "SELECT {THOUGHT_COLUMNS} FROM thoughts WHERE trace_id = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                trace_id.as_str(),
            )?
            .ok_or_else(|| ThoughtError::ThoughtNotFound(format!("trace {trace_id}")))?;
            tx.commit().map_err(sql_err)?;
            Ok(record)
        })
        .await
    }

    async fn delete_thought(&self, ctx: &Context, id: ThoughtId) -> ThoughtResult<()> {
        self.run(ctx, "delete_thought", move |conn, ctx| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err)?;
            let id_str = id.to_string();
            let notes = tx
                .execute(
                    "DELETE FROM notes WHERE thought_id = ?1",
                    rusqlite::params![id_str],
                )
                .map_err(sql_err)?;
            let removed = tx
                .execute("DELETE FROM thoughts WHERE id = ?1", rusqlite::params![id_str])
                .map_err(sql_err)?;
            if removed == 0 {
                return Err(ThoughtError::ThoughtNotFound(id_str));
            }
            tx.execute(
                "INSERT OR IGNORE INTO retired_thoughts (id, deleted_at) VALUES (?1, ?2)",
                rusqlite::params![id_str, Utc::now().to_rfc3339()],
            )
            .map_err(sql_err)?;
            commit_unless_done(tx, ctx)?;
            debug!(id = %id, notes, "Deleted thought");
            Ok(())
        })
        .await
    }

    async fn put_note(&self, ctx: &Context, note: &Note) -> ThoughtResult<()> {
        note.validate()?;
        let note = note.clone();
        self.run(ctx, "put_note", move |conn, ctx| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err)?;
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM thoughts WHERE id = ?1)",
                    rusqlite::params![note.thought_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            if !exists {
                return Err(ThoughtError::ThoughtNotFound(note.thought_id.to_string()));
            }
            upsert_note(&tx, &note)?;
            commit_unless_done(tx, ctx)?;
            debug!(thought = %note.thought_id, key = %note.key, "Stored note");
            Ok(())
        })
        .await
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
        let query = query.to_vec();
        self.run_read(ctx, "search_notes", move |conn, _| {
            let candidates = load_candidates(conn, None, true, None)?;
            let total = candidates.len();
            let notes = rank_by_similarity(&query, candidates, limit);
            debug!(
                "Similarity search: {} results from {} candidates",
                notes.len(),
                total
            );
            Ok(notes)
        })
        .await
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
        let query = similarity_query(filter.query_embedding.as_deref(), limit)?.map(<[f32]>::to_vec);
        let filter = filter.clone();
        self.run_read(ctx, "search_notes_by_task", move |conn, _| {
            let notes = match query {
                Some(ref q) => {
                    let candidates = load_candidates(conn, Some(&filter), true, None)?;
                    rank_by_similarity(q, candidates, limit)
                }
                None => {
                    let candidates = load_candidates(conn, Some(&filter), false, Some(limit))?;
                    rank_by_recency(candidates, limit)
                }
            };
            debug!(results = notes.len(), "Task search");
            Ok(notes)
        })
        .await
    }
}

/// Open a connection for a connection string.
fn open_connection(url: &str) -> rusqlite::Result<Connection> {
    let target = strip_scheme(url);
    if target.is_empty() || target == ":memory:" {
        return Connection::open_in_memory();
    }
    if !target.starts_with("file:") {
        if let Some(parent) = Path::new(target).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), "Cannot create database directory: {e}");
                }
            }
        }
    }
    Connection::open_with_flags(
        target,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn is_memory_url(url: &str) -> bool {
    let target = strip_scheme(url);
    target.is_empty() || target == ":memory:" || target.contains("mode=memory")
}

/// Commit `tx` only while `ctx` is live. Dropping the transaction rolls it back.
fn commit_unless_done(tx: Transaction<'_>, ctx: &Context) -> ThoughtResult<()> {
    ctx.check()?;
    tx.commit().map_err(sql_err)
}

/// Classify a rusqlite error.
fn sql_err(e: rusqlite::Error) -> ThoughtError {
    match e.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => ThoughtError::Canceled,
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            ThoughtError::Busy(e.to_string())
        }
        _ => ThoughtError::Storage(e.to_string()),
    }
}

fn upsert_note(conn: &Connection, note: &Note) -> ThoughtResult<()> {
    let embedding: Option<Vec<u8>> = note.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO notes (thought_id, key, value, source, embedding, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(thought_id, key) DO UPDATE SET value = ?3, source = ?4, embedding = ?5, updated_at = ?6",
        rusqlite::params![
            note.thought_id.to_string(),
            note.key,
            note.value,
            note.source,
            embedding,
            note.updated_at.to_rfc3339(),
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

/// Read one thought row with `sql` (one `?1` parameter) and hydrate its notes.
fn load_thought(conn: &Connection, sql: &str, param: &str) -> ThoughtResult<Option<ThoughtRecord>> {
    let row = conn
        .query_row(sql, rusqlite::params![param], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()
        .map_err(sql_err)?;

    let Some((id_str, intent, trace_id, created_str)) = row else {
        return Ok(None);
    };
    let id: ThoughtId = id_str
        .parse()
        .map_err(|e: ThoughtError| ThoughtError::Storage(e.to_string()))?;
    let notes = load_notes(conn, id)?;
    Ok(Some(ThoughtRecord {
        id,
        intent,
        trace_id: TraceId(trace_id),
        created_at: parse_timestamp(&created_str)?,
        notes,
    }))
}

fn load_notes(conn: &Connection, thought_id: ThoughtId) -> ThoughtResult<BTreeMap<String, Note>> {
    let mut stmt = conn
        .prepare(
            "SELECT key, value, source, embedding, updated_at FROM notes WHERE thought_id = ?1 ORDER BY key",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(rusqlite::params![thought_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(sql_err)?;

    let mut notes = BTreeMap::new();
    for row in rows {
        let (key, value, source, embedding, updated_str) = row.map_err(sql_err)?;
        notes.insert(
            key.clone(),
            Note {
                thought_id,
                key,
                value,
                source,
                embedding: embedding.as_deref().map(embedding_from_bytes),
                updated_at: parse_timestamp(&updated_str)?,
            },
        );
    }
    Ok(notes)
}

/// Collect notes joined with their thought's sequence, filtered by `filter`.
fn load_candidates(
    conn: &Connection,
    filter: Option<&TaskFilter>,
    embedded_only: bool,
    recency_limit: Option<usize>,
) -> ThoughtResult<Vec<Candidate>> {
    let mut sql = String::from(
        "SELECT t.seq, n.thought_id, n.key, n.value, n.source, n.embedding, n.updated_at
         FROM notes n JOIN thoughts t ON t.id = n.thought_id
         WHERE 1=1",
    );
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if embedded_only {
        sql.push_str(" AND n.embedding IS NOT NULL");
    }
    if let Some(f) = filter {
        if let Some(ref trace_id) = f.trace_id {
            params.push(Box::new(trace_id.0.clone()));
            sql.push_str(&format!(" AND t.trace_id = ?{}", params.len()));
        }
        if let Some(text) = f.intent_contains.as_deref().filter(|t| !t.is_empty()) {
            params.push(Box::new(like_pattern(text)));
            sql.push_str(&format!(" AND t.intent LIKE ?{} ESCAPE '\\'", params.len()));
        }
        if let Some(ref source) = f.source {
            params.push(Box::new(source.clone()));
            sql.push_str(&format!(" AND n.source = ?{}", params.len()));
        }
    }
    if let Some(limit) = recency_limit {
        params.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(
            " ORDER BY t.seq DESC, n.key ASC LIMIT ?{}",
            params.len()
        ));
    }

    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<Vec<u8>>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .map_err(sql_err)?;

    let mut candidates = Vec::new();
    for row in rows {
        let (seq, thought_str, key, value, source, embedding, updated_str) =
            row.map_err(sql_err)?;
        let thought_id = match thought_str.parse::<ThoughtId>() {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key, "Skipping note with bad thought ID: {e}");
                continue;
            }
        };
        let updated_at = match parse_timestamp(&updated_str) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(thought = %thought_id, key = %key, "Skipping note: {e}");
                continue;
            }
        };
        candidates.push(Candidate {
            seq,
            note: Note {
                thought_id,
                key,
                value,
                source,
                embedding: embedding.as_deref().map(embedding_from_bytes),
                updated_at,
            },
        });
    }
    Ok(candidates)
}

/// `%text%` with LIKE wildcards in `text` escaped by `\`.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn parse_timestamp(s: &str) -> ThoughtResult<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ThoughtError::Storage(format!("corrupt timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use thoughtstore_types::thought::Thought;

    /// Counts to ten billion; only an interrupt ends it in test time.
    const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c)
         SELECT COUNT(*) FROM (SELECT x FROM c LIMIT 10000000000)";

    fn setup() -> Arc<SqliteMemory> {
        Arc::new(SqliteMemory::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = setup();
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, store.clone(), "test intent").await.unwrap();
        thought
            .set_content(&ctx, "key1", "value1", "test")
            .await
            .unwrap();

        let retrieved = Thought::get(&ctx, store, thought.id()).await.unwrap();
        assert_eq!(retrieved.intent(), "test intent");
        assert_eq!(retrieved.all_notes().len(), 1);
        assert_eq!(retrieved.get_content("key1").unwrap(), "value1");
    }

    #[tokio::test]
    async fn test_create_with_notes_hydrates_all() {
        let store = setup();
        let ctx = Context::background();
        let mut record = ThoughtRecord::new("batch", None).unwrap();
        for i in 0..5 {
            record
                .upsert_note(Note::new(record.id, format!("k{i}"), "v", "seed"))
                .unwrap();
        }
        store.create_thought(&ctx, &record).await.unwrap();
        let loaded = store.get_thought(&ctx, record.id).await.unwrap();
        assert_eq!(loaded.notes.len(), 5);
        assert_eq!(loaded.intent, "batch");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_storage_error() {
        let store = setup();
        let ctx = Context::background();
        let record = ThoughtRecord::new("once", None).unwrap();
        store.create_thought(&ctx, &record).await.unwrap();
        let err = store.create_thought(&ctx, &record).await.unwrap_err();
        assert!(matches!(err, ThoughtError::Storage(_)));
    }

    #[tokio::test]
    async fn test_deleted_id_is_never_reused() {
        let store = setup();
        let ctx = Context::background();
        let record = ThoughtRecord::new("short lived", None).unwrap();
        store.create_thought(&ctx, &record).await.unwrap();
        store.delete_thought(&ctx, record.id).await.unwrap();
        let err = store.create_thought(&ctx, &record).await.unwrap_err();
        assert!(matches!(err, ThoughtError::Storage(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_notes() {
        let store = setup();
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, store.clone(), "doomed").await.unwrap();
        thought.set_content(&ctx, "a", "1", "t").await.unwrap();
        thought.set_content(&ctx, "b", "2", "t").await.unwrap();
        let id = thought.id();
        thought.delete(&ctx).await.unwrap();

        let conn = store.conn.lock().unwrap();
        let orphans: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notes WHERE thought_id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = setup();
        let err = store
            .delete_thought(&Context::background(), ThoughtId::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_note_on_missing_thought() {
        let store = setup();
        let note = Note::new(ThoughtId::new(), "k", "v", "s");
        let err = store
            .put_note(&Context::background(), &note)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_clears_stale_embedding() {
        let store = setup();
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, store.clone(), "embed").await.unwrap();
        thought
            .set_content_with_embedding(&ctx, "k", "v1", "a", vec![1.0, 0.0])
            .await
            .unwrap();
        thought.set_content(&ctx, "k", "v2", "b").await.unwrap();

        let loaded = store.get_thought(&ctx, thought.id()).await.unwrap();
        assert_eq!(loaded.notes["k"].value, "v2");
        assert_eq!(loaded.notes["k"].source, "b");
        assert!(loaded.notes["k"].embedding.is_none());
        let hits = store.search_notes(&ctx, Some(&[1.0, 0.0][..]), 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_task_search_filters() {
        let store = setup();
        let ctx = Context::background();
        let mut a = Thought::new_with_trace(&ctx, store.clone(), "Deploy service", "t-a")
            .await
            .unwrap();
        a.set_content(&ctx, "plan", "roll out", "planner").await.unwrap();
        a.set_content(&ctx, "risk", "downtime", "critic").await.unwrap();
        let mut b = Thought::new_with_trace(&ctx, store.clone(), "write 100%_docs", "t-b")
            .await
            .unwrap();
        b.set_content(&ctx, "plan", "outline", "planner").await.unwrap();

        let by_trace = store
            .search_notes_by_task(&ctx, Some(&TaskFilter::trace("t-a")), 10)
            .await
            .unwrap();
        assert_eq!(by_trace.len(), 2);
        assert!(by_trace.iter().all(|n| n.thought_id == a.id()));

        let by_intent = store
            .search_notes_by_task(&ctx, Some(&TaskFilter::intent("deploy")), 10)
            .await
            .unwrap();
        assert_eq!(by_intent.len(), 2);

        let literal = store
            .search_notes_by_task(&ctx, Some(&TaskFilter::intent("100%_")), 10)
            .await
            .unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].thought_id, b.id());

        let planners = store
            .search_notes_by_task(
                &ctx,
                Some(&TaskFilter::default().with_source("planner")),
                10,
            )
            .await
            .unwrap();
        let owners: Vec<ThoughtId> = planners.iter().map(|n| n.thought_id).collect();
        assert_eq!(owners, [b.id(), a.id()]);
    }

    #[tokio::test]
    async fn test_canceled_context_aborts_write() {
        let store = setup();
        let ctx = Context::background();
        let mut thought = Thought::new(&ctx, store.clone(), "cancel me").await.unwrap();

        let canceled = ctx.child();
        canceled.cancel();
        let err = thought
            .set_content(&canceled, "k", "v", "s")
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));
        assert!(thought.all_notes().is_empty());

        let loaded = store.get_thought(&ctx, thought.id()).await.unwrap();
        assert!(loaded.notes.is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_surfaces_canceled() {
        let store = setup();
        let expired = Context::with_deadline(Instant::now() - Duration::from_millis(1));
        let err = store
            .get_thought(&expired, ThoughtId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_interrupts_running_statement() {
        let store = setup();
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = store
            .run(&ctx, "count_forever", |conn, _| {
                conn.query_row(SLOW_COUNT, [], |row| row.get::<_, i64>(0))
                    .map_err(sql_err)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The connection stays usable for later operations.
        Thought::new(&Context::background(), store, "after")
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deadline_interrupts_running_statement() {
        let store = setup();
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let err = store
            .run(&ctx, "count_forever", |conn, _| {
                conn.query_row(SLOW_COUNT, [], |row| row.get::<_, i64>(0))
                    .map_err(sql_err)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));
    }

    #[tokio::test]
    async fn test_context_done_before_commit_rolls_back() {
        let store = setup();
        let ctx = Context::background();
        let thought = Thought::new(&ctx, store.clone(), "half written").await.unwrap();
        let id = thought.id();

        let write_ctx = ctx.child();
        let err = store
            .run(&write_ctx, "put_two_notes", move |conn, ctx| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err)?;
                upsert_note(&tx, &Note::new(id, "a", "1", "s"))?;
                upsert_note(&tx, &Note::new(id, "b", "2", "s"))?;
                // Expires after every statement has run, right before COMMIT.
                ctx.cancel();
                commit_unless_done(tx, ctx)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Canceled));

        let loaded = store.get_thought(&ctx, id).await.unwrap();
        assert!(loaded.notes.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_storage_error() {
        let store = setup();
        let ctx = Context::background();
        let mut thought = Thought::new_with_trace(&ctx, store.clone(), "rotten", "t-rot")
            .await
            .unwrap();
        thought.set_content(&ctx, "k", "v", "s").await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE notes SET updated_at = 'yesterday' WHERE thought_id = ?1",
                rusqlite::params![thought.id().to_string()],
            )
            .unwrap();

        let err = store.get_thought(&ctx, thought.id()).await.unwrap_err();
        assert!(matches!(err, ThoughtError::Storage(ref m) if m.contains("yesterday")));

        // Search skips the unreadable row instead of failing.
        let hits = store
            .search_notes_by_task(&ctx, Some(&TaskFilter::trace("t-rot")), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_store_survives_panicked_operation() {
        let store = setup();
        let ctx = Context::background();
        let thought = Thought::new(&ctx, store.clone(), "before").await.unwrap();
        let id = thought.id();

        let err = store
            .run(&ctx, "explode", move |conn, _| -> ThoughtResult<()> {
                let tx = conn.transaction().map_err(sql_err)?;
                upsert_note(&tx, &Note::new(id, "partial", "x", "s"))?;
                panic!("operation panicked mid-transaction");
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ThoughtError::Internal(_)));

        let loaded = store.get_thought(&ctx, id).await.unwrap();
        assert!(loaded.notes.is_empty());
        Thought::new(&ctx, store, "after").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writers_last_write_wins() {
        let store = setup();
        let ctx = Context::background();
        let thought = Thought::new(&ctx, store.clone(), "shared").await.unwrap();
        let id = thought.id();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let note = Note::new(id, "counter", format!("v{i}"), format!("w{i}"));
                store.put_note(&Context::background(), &note).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let loaded = store.get_thought(&ctx, id).await.unwrap();
        assert_eq!(loaded.notes.len(), 1);
        let note = &loaded.notes["counter"];
        assert_eq!(note.value[1..], note.source[1..]);
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a%b_c\\"), "%a\\%b\\_c\\\\%");
    }

    #[test]
    fn test_connection_string_forms() {
        assert_eq!(strip_scheme("sqlite:///tmp/x.db"), "/tmp/x.db");
        assert_eq!(strip_scheme("sqlite::memory:"), ":memory:");
        assert_eq!(strip_scheme(" /data/t.db "), "/data/t.db");
        assert!(is_memory_url(":memory:"));
        assert!(is_memory_url("file:shared?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite://thoughts.db"));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("thoughts.db");
        let config = StoreConfig::with_url(format!("sqlite://{}", path.display()));
        let ctx = Context::background();

        let id = {
            let store: Arc<dyn Memory> = Arc::new(SqliteMemory::open(&config).unwrap());
            let mut thought = Thought::new(&ctx, store, "durable").await.unwrap();
            thought.set_content(&ctx, "k", "v", "s").await.unwrap();
            thought.id()
        };

        let reopened = SqliteMemory::open(&config).unwrap();
        let loaded = reopened.get_thought(&ctx, id).await.unwrap();
        assert_eq!(loaded.intent, "durable");
        assert_eq!(loaded.notes["k"].value, "v");
    }
}
