//! Hydration: reconstruct in-memory run state from the durable store.
//!
//! The central subtlety is *derived-status promotion*: if every expected
//! iteration of a foreach step is `success`/`skipped` but the parent row
//! was left `running` (the process died between the last iteration commit
//! and the parent commit), the reconstructed in-memory status is promoted to
//! `success`. The database row is left untouched: promotion is derivation,
//! not a write.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use strand_types::error::EngineError;
use strand_types::workflow::{
    Run, StepExecution, StepStatus, Workflow, FOREACH_ITEMS_KEY,
};
use uuid::Uuid;

use crate::context::StepContext;
use crate::exec::human::default_event_name;
use crate::store::StateStore;

/// Above this iteration count, hydration skips per-iteration outputs and
/// exposes empty aggregates to cap memory. Downstream references see `[]`.
pub const LARGE_FOREACH_THRESHOLD: u64 = 500;

/// Everything the runner needs to resume a run.
#[derive(Debug)]
pub struct HydratedState {
    pub run: Run,
    /// Contexts for completed steps (what downstream expressions see).
    pub steps: HashMap<String, StepContext>,
    /// Step ids completed for scheduling purposes.
    pub completed: HashSet<String>,
    /// Suspended steps whose awaited event has been delivered:
    /// step id -> resume payload (suspension output plus `__answer`).
    pub resumable: HashMap<String, Value>,
    /// Suspended steps still waiting; payload is the suspension output.
    pub still_suspended: HashMap<String, Value>,
}

/// Rebuild run state from the store. Read-only: hydration never writes.
pub async fn hydrate_run<S: StateStore>(
    store: &S,
    workflow: &Workflow,
    run_id: &Uuid,
) -> Result<HydratedState, EngineError> {
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| EngineError::Config(format!("run {run_id} not found")))?;

    let mut state = HydratedState {
        run,
        steps: HashMap::new(),
        completed: HashSet::new(),
        resumable: HashMap::new(),
        still_suspended: HashMap::new(),
    };

    for step in &workflow.steps {
        if step.foreach.is_some() {
            hydrate_foreach(store, run_id, &step.id, &mut state).await?;
        } else {
            hydrate_plain(store, run_id, &step.id, &mut state).await?;
        }
    }

    Ok(state)
}

async fn hydrate_plain<S: StateStore>(
    store: &S,
    run_id: &Uuid,
    step_id: &str,
    state: &mut HydratedState,
) -> Result<(), EngineError> {
    let Some(main) = store.get_main_step(run_id, step_id).await? else {
        return Ok(());
    };

    match main.status {
        StepStatus::Success => {
            let output = main.output.unwrap_or(Value::Null);
            state
                .steps
                .insert(step_id.to_string(), StepContext::success(output));
            state.completed.insert(step_id.to_string());
        }
        StepStatus::Skipped => {
            state
                .steps
                .insert(step_id.to_string(), StepContext::skipped());
            state.completed.insert(step_id.to_string());
        }
        StepStatus::Suspended => {
            let output = main.output.clone().unwrap_or(json!({}));
            let event_name = output
                .get("event")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| default_event_name(run_id, step_id));

            match store.get_external_event(&event_name).await? {
                Some(event) => {
                    let mut payload = match output {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    let answer = event
                        .payload
                        .get("__answer")
                        .cloned()
                        .unwrap_or(event.payload.clone());
                    payload.insert("__answer".to_string(), answer);
                    state
                        .resumable
                        .insert(step_id.to_string(), Value::Object(payload));
                }
                None => {
                    state.still_suspended.insert(step_id.to_string(), output);
                }
            }
        }
        // Failed, crashed mid-run, or never started: the step re-executes.
        StepStatus::Failed | StepStatus::Running | StepStatus::Pending => {}
    }

    Ok(())
}

async fn hydrate_foreach<S: StateStore>(
    store: &S,
    run_id: &Uuid,
    step_id: &str,
    state: &mut HydratedState,
) -> Result<(), EngineError> {
    let Some(main) = store.get_main_step(run_id, step_id).await? else {
        return Ok(());
    };

    let count = store.count_step_iterations(run_id, step_id).await?;
    let large = count > LARGE_FOREACH_THRESHOLD;
    if large {
        tracing::warn!(
            step_id,
            iterations = count,
            threshold = LARGE_FOREACH_THRESHOLD,
            "large foreach: hydrating without per-iteration outputs; \
             downstream references to this step's output see an empty aggregate"
        );
    }

    let iterations = store
        .get_step_iterations(run_id, step_id, !large)
        .await?;

    // Latest row per index; retries and resumes leave older rows behind.
    let mut latest: HashMap<u32, StepExecution> = HashMap::new();
    for exec in iterations {
        if let Some(i) = exec.iteration {
            latest.insert(i, exec);
        }
    }

    // Expected iteration count: the persisted item-list hint, else what the
    // table holds.
    let expected = main
        .output
        .as_ref()
        .and_then(|o| o.get(FOREACH_ITEMS_KEY))
        .and_then(Value::as_array)
        .map(|items| items.len())
        .unwrap_or(latest.len());

    let mut items: Vec<StepContext> = Vec::with_capacity(expected);
    for i in 0..expected as u32 {
        match latest.get(&i) {
            Some(exec) => {
                let output = exec.output.clone().unwrap_or(Value::Null);
                items.push(StepContext {
                    output: output.clone(),
                    outputs: if output.is_object() { output } else { json!({}) },
                    status: exec.status,
                    error: exec.error.clone(),
                    items: None,
                });
            }
            None => items.push(StepContext {
                output: Value::Null,
                outputs: json!({}),
                status: StepStatus::Pending,
                error: None,
                items: None,
            }),
        }
    }

    // Derived parent status: worst iteration wins; a fully-completed set is
    // promoted to success even when the DB row still says running.
    let any_failed = items.iter().any(|c| c.status == StepStatus::Failed);
    let all_completed = expected > 0 && items.iter().all(|c| c.status.is_completed());
    let derived = if main.status == StepStatus::Success || all_completed {
        StepStatus::Success
    } else if any_failed && items.iter().all(|c| c.status.is_terminal()) {
        StepStatus::Failed
    } else {
        StepStatus::Running
    };

    if derived != main.status {
        tracing::debug!(
            step_id,
            db_status = main.status.as_str(),
            derived = derived.as_str(),
            "foreach parent status derived from iterations"
        );
    }

    if derived == StepStatus::Success {
        let (output, outputs) = if large {
            (json!([]), json!({}))
        } else {
            let output: Vec<Value> = items.iter().map(|c| c.output.clone()).collect();
            let all_objects =
                !items.is_empty() && items.iter().all(|c| c.output.is_object());
            let merged = if all_objects {
                let mut merged = Map::new();
                for context in &items {
                    if let Value::Object(map) = &context.output {
                        for (k, v) in map {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                }
                Value::Object(merged)
            } else {
                json!({})
            };
            (Value::Array(output), merged)
        };

        state.steps.insert(
            step_id.to_string(),
            StepContext {
                output,
                outputs,
                status: StepStatus::Success,
                error: None,
                items: Some(items),
            },
        );
        state.completed.insert(step_id.to_string());
    }
    // Failed or partially-run fan-outs re-execute; run_foreach reuses the
    // completed iterations it finds in the table.

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
