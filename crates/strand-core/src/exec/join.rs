//! Join executor: a synchronization-only barrier.
//!
//! The scheduler already guarantees every dependency completed before a join
//! becomes runnable (and a failed dependency keeps it from ever running), so
//! execution just aggregates the dependency list.

use serde_json::json;
use strand_types::workflow::Step;

use super::StepResult;

pub fn run_join(step: &Step) -> StepResult {
    StepResult::success(json!({ "completed": step.needs }))
}
