//! Memory seams: the embedding generator and the vector store backing
//! `memory` steps. Both are object-safe (boxed futures) because the engine
//! context holds them as trait objects; the SQLite vector store lives in
//! `strand-infra`, the embedder comes from the model adapter.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strand_types::error::StoreError;
use uuid::Uuid;

/// Embedding generator. `dimension()` must match the vectors `embed`
/// produces; the vector store keys its tables on it.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, String>>;
}

/// A stored memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(text: impl Into<String>, embedding: Vec<f32>, metadata: Option<Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            text: text.into(),
            embedding,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// A search result with its cosine similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub score: f32,
}

/// Vector store shared process-wide across all runs.
pub trait VectorStore: Send + Sync {
    /// Insert an entry. Implementations route to a table matching the
    /// embedding dimension (creating a dimension-suffixed table on mismatch).
    fn insert<'a>(&'a self, entry: &'a MemoryEntry) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Top-`limit` entries by cosine similarity to `embedding`.
    fn search<'a>(
        &'a self,
        embedding: &'a [f32],
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<MemoryHit>, StoreError>>;
}

/// Cosine similarity of two vectors; zero for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.2, -0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_opposite() {
        let score = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((score + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
