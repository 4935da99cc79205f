//! Note ranking shared by every backend.
//!
//! Backends collect candidate notes (with the creation sequence of their
//! owning thought) and hand them here, so identical data ranks identically
//! no matter where it is stored.
//!
//! Similarity order: cosine score descending, then thought sequence
//! ascending, then note key ascending. Notes without an embedding, or with
//! one of a different dimension, are not candidates.
//!
//! Recency order (task search without a vector): thought sequence
//! descending, then note key ascending.

use std::cmp::Ordering;
use thoughtstore_types::error::{ThoughtError, ThoughtResult};
use thoughtstore_types::thought::Note;

/// A note plus the creation sequence of the thought that owns it.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Creation sequence of the owning thought (higher is newer).
    pub seq: i64,
    /// The note itself.
    pub note: Note,
}

/// Normalize a similarity query.
///
/// Returns `None` for the trivial query (absent, empty, or `limit == 0`),
/// which callers answer with an empty result.
pub fn similarity_query(query: Option<&[f32]>, limit: usize) -> ThoughtResult<Option<&[f32]>> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Ok(None);
    };
    if limit == 0 {
        return Ok(None);
    }
    if query.iter().any(|v| !v.is_finite()) {
        return Err(ThoughtError::InvalidInput(
            "query vector contains non-finite values".into(),
        ));
    }
    Ok(Some(query))
}

/// Rank candidates by cosine similarity to `query` and keep the best `limit`.
pub fn rank_by_similarity(query: &[f32], candidates: Vec<Candidate>, limit: usize) -> Vec<Note> {
    let mut scored: Vec<(f32, Candidate)> = candidates
        .into_iter()
        .filter_map(|c| {
            let embedding = c.note.embedding.as_deref()?;
            if embedding.len() != query.len() {
                return None;
            }
            let score = cosine_similarity(query, embedding);
            Some((if score.is_nan() { f32::NEG_INFINITY } else { score }, c))
        })
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .total_cmp(score_a)
            .then(a.seq.cmp(&b.seq))
            .then_with(|| a.note.key.cmp(&b.note.key))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, c)| c.note).collect()
}

/// Order candidates newest thought first and keep `limit`.
pub fn rank_by_recency(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Note> {
    candidates.sort_by(|a, b| match b.seq.cmp(&a.seq) {
        Ordering::Equal => a.note.key.cmp(&b.note.key),
        other => other,
    });
    candidates.truncate(limit);
    candidates.into_iter().map(|c| c.note).collect()
}

/// Compute cosine similarity between two vectors.
///
/// Sums are kept in `f64` so large finite components cannot overflow the norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f64, 0.0f64, 0.0f64), |(dot, na, nb), (&x, &y)| {
            let (x, y) = (f64::from(x), f64::from(y));
            (dot + x * y, na + x * x, nb + y * y)
        });
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0) as f32
    }
}

/// Serialize embedding to bytes for SQLite BLOB storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize embedding from bytes.
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
