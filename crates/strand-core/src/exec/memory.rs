//! Memory executor: store to or search the shared embeddings table.
//!
//! Embeddings come from the engine's [`Embedder`] handle; the vector store
//! routes rows to a table matching the embedder's dimension.

use std::sync::Arc;

use serde_json::{json, Value};
use strand_types::error::EngineError;
use strand_types::workflow::MemoryOp;

use super::StepResult;
use crate::memory::MemoryEntry;
use crate::runner::EngineContext;
use crate::store::StateStore;

pub async fn run_memory<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    op: MemoryOp,
    text: Option<&str>,
    query: Option<&str>,
    limit: u32,
    metadata: Option<&Value>,
    expr_ctx: &Value,
) -> StepResult {
    let (Some(embedder), Some(vectors)) = (&engine.embedder, &engine.vector_store) else {
        return StepResult::failed(
            "memory steps require an embedder and a vector store".to_string(),
        );
    };

    let eval = |tpl: &str| {
        engine
            .evaluator
            .evaluate_string(tpl, expr_ctx)
            .map_err(|e| {
                EngineError::Expression {
                    message: e.to_string(),
                    step_id: None,
                }
                .to_string()
            })
    };

    match op {
        MemoryOp::Store => {
            let Some(text) = text else {
                return StepResult::failed("memory store requires 'text'".to_string());
            };
            let text = match eval(text) {
                Ok(text) => text,
                Err(message) => return StepResult::failed(message),
            };

            let embeddings = match embedder.embed(std::slice::from_ref(&text)).await {
                Ok(embeddings) => embeddings,
                Err(e) => return StepResult::failed(format!("embedding failed: {e}")),
            };
            let Some(embedding) = embeddings.into_iter().next() else {
                return StepResult::failed("embedder returned no vectors".to_string());
            };

            let entry = MemoryEntry::new(text, embedding, metadata.cloned());
            if let Err(e) = vectors.insert(&entry).await {
                return StepResult::failed(format!("memory insert failed: {e}"));
            }
            StepResult::success(json!({ "stored": true, "id": entry.id }))
        }
        MemoryOp::Search => {
            let Some(query) = query else {
                return StepResult::failed("memory search requires 'query'".to_string());
            };
            let query = match eval(query) {
                Ok(query) => query,
                Err(message) => return StepResult::failed(message),
            };

            let embeddings = match embedder.embed(std::slice::from_ref(&query)).await {
                Ok(embeddings) => embeddings,
                Err(e) => return StepResult::failed(format!("embedding failed: {e}")),
            };
            let Some(embedding) = embeddings.into_iter().next() else {
                return StepResult::failed("embedder returned no vectors".to_string());
            };

            match vectors.search(&embedding, limit as usize).await {
                Ok(hits) => StepResult::success(json!({
                    "query": query,
                    "results": hits,
                })),
                Err(e) => StepResult::failed(format!("memory search failed: {e}")),
            }
        }
    }
}
