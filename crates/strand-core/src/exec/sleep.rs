//! Sleep executor: a cooperative pause that resolves immediately as failed
//! on cancellation.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{StepResult, CANCELED};

pub async fn run_sleep(duration_ms: u64, cancel: &CancellationToken) -> StepResult {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
            StepResult::success(json!({ "slept_ms": duration_ms }))
        }
        _ = cancel.cancelled() => StepResult::failed(CANCELED),
    }
}
