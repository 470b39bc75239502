//! SQLite vector store for `memory` steps.
//!
//! Rows live in a table keyed to the embedder's dimension: `memory` for the
//! default 384-dimension models, `memory_<dim>` otherwise, so switching
//! embedding models never mixes incompatible vectors. Embeddings are stored
//! as little-endian f32 BLOBs; search is a brute-force cosine scan, which is
//! the right trade at the scale of an engine-local memory table.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use sqlx::Row;
use strand_core::memory::{cosine_similarity, MemoryEntry, MemoryHit, VectorStore};
use strand_types::error::StoreError;
use uuid::Uuid;

use super::pool::DatabasePool;

/// Dimension served by the unsuffixed `memory` table.
pub const DEFAULT_MEMORY_DIMENSION: usize = 384;

/// SQLite-backed [`VectorStore`], shared process-wide across runs.
pub struct SqliteVectorStore {
    pool: DatabasePool,
    dimension: usize,
    table: String,
    table_ready: AtomicBool,
}

impl SqliteVectorStore {
    /// Create a store for vectors of the given dimension.
    pub fn new(pool: DatabasePool, dimension: usize) -> Self {
        let table = if dimension == DEFAULT_MEMORY_DIMENSION {
            "memory".to_string()
        } else {
            format!("memory_{dimension}")
        };
        Self {
            pool,
            dimension,
            table,
            table_ready: AtomicBool::new(false),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the dimension-suffixed table on first use. Runs outside the
    /// migration set because the dimension is only known at runtime.
    async fn ensure_table(&self) -> Result<(), StoreError> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id          TEXT PRIMARY KEY,
                text        TEXT NOT NULL,
                embedding   BLOB NOT NULL,
                metadata    TEXT,
                created_at  TEXT NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        self.table_ready.store(true, Ordering::Release);
        Ok(())
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl VectorStore for SqliteVectorStore {
    fn insert<'a>(&'a self, entry: &'a MemoryEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if entry.embedding.len() != self.dimension {
                return Err(StoreError::Query(format!(
                    "embedding dimension {} does not match table dimension {}",
                    entry.embedding.len(),
                    self.dimension
                )));
            }
            self.ensure_table().await?;

            let metadata = entry
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).map_err(|e| StoreError::Query(e.to_string())))
                .transpose()?;

            sqlx::query(&format!(
                "INSERT INTO {} (id, text, embedding, metadata, created_at) VALUES (?, ?, ?, ?, ?)",
                self.table
            ))
            .bind(entry.id.to_string())
            .bind(&entry.text)
            .bind(encode_embedding(&entry.embedding))
            .bind(&metadata)
            .bind(entry.created_at.to_rfc3339())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
            Ok(())
        })
    }

    fn search<'a>(
        &'a self,
        embedding: &'a [f32],
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<MemoryHit>, StoreError>> {
        Box::pin(async move {
            self.ensure_table().await?;

            let rows = sqlx::query(&format!(
                "SELECT id, text, embedding, metadata FROM {}",
                self.table
            ))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

            let mut hits: Vec<MemoryHit> = Vec::with_capacity(rows.len());
            for row in &rows {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                let text: String = row
                    .try_get("text")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                let blob: Vec<u8> = row
                    .try_get("embedding")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                let metadata: Option<String> = row
                    .try_get("metadata")
                    .map_err(|e| StoreError::Query(e.to_string()))?;

                let stored = decode_embedding(&blob);
                let score = cosine_similarity(embedding, &stored);
                hits.push(MemoryHit {
                    id: id
                        .parse::<Uuid>()
                        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))?,
                    text,
                    metadata: metadata
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()
                        .map_err(|e| StoreError::Query(format!("invalid metadata: {e}")))?,
                    score,
                });
            }

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(limit);
            Ok(hits)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("m.db").display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn entry(text: &str, embedding: Vec<f32>) -> MemoryEntry {
        MemoryEntry::new(text, embedding, Some(json!({"source": "test"})))
    }

    #[test]
    fn test_embedding_codec_roundtrip() {
        let original = vec![0.5f32, -1.25, 3.0, f32::MIN_POSITIVE];
        let decoded = decode_embedding(&encode_embedding(&original));
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_table_name_follows_dimension() {
        // Construction is synchronous; the pool is only touched on use.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = rt.block_on(test_pool());
        assert_eq!(
            SqliteVectorStore::new(pool.clone(), DEFAULT_MEMORY_DIMENSION).table(),
            "memory"
        );
        assert_eq!(SqliteVectorStore::new(pool, 1536).table(), "memory_1536");
    }

    #[tokio::test]
    async fn test_insert_and_search_ranked_by_similarity() {
        let store = SqliteVectorStore::new(test_pool().await, 3);

        store.insert(&entry("north", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.insert(&entry("east", vec![0.0, 1.0, 0.0])).await.unwrap();
        store
            .insert(&entry("north-east", vec![0.7, 0.7, 0.0]))
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "north");
        assert_eq!(hits[1].text, "north-east");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].metadata.as_ref().unwrap()["source"], "test");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = SqliteVectorStore::new(test_pool().await, 3);
        let result = store.insert(&entry("wrong", vec![1.0, 0.0])).await;
        assert!(matches!(result, Err(StoreError::Query(_))));
    }

    #[tokio::test]
    async fn test_search_empty_table() {
        let store = SqliteVectorStore::new(test_pool().await, 3);
        let hits = store.search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
