//! Sub-workflow executor: run a referenced workflow as a child run sharing
//! the same store, then map its outputs back into the parent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use strand_types::error::EngineError;
use strand_types::event::EngineEvent;
use strand_types::workflow::RunStatus;
use tokio_util::sync::CancellationToken;

use super::{audit, StepResult};
use crate::context::RunContext;
use crate::runner::{EngineContext, RunOptions, WorkflowRunner};
use crate::store::StateStore;

/// Maximum sub-workflow nesting depth, tracked on the engine context.
pub const MAX_SUB_WORKFLOW_DEPTH: u32 = 5;

#[allow(clippy::too_many_arguments)]
pub async fn run_sub_workflow<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    run_ctx: &RunContext,
    step_id: &str,
    child_name: &str,
    inputs: &BTreeMap<String, Value>,
    output_mapping: &HashMap<String, String>,
    expr_ctx: &Value,
    cancel: &CancellationToken,
) -> StepResult {
    let Some(child_workflow) = engine.workflows.get(child_name).cloned() else {
        return StepResult::failed(format!("unknown sub-workflow '{child_name}'"));
    };

    // Evaluate child inputs: string values are templates, the rest literal.
    let mut child_inputs = Map::new();
    for (name, value) in inputs {
        let evaluated = match value {
            Value::String(template) => match engine.evaluator.evaluate(template, expr_ctx) {
                Ok(evaluated) => evaluated,
                Err(e) => {
                    return StepResult::failed(
                        EngineError::Expression {
                            message: format!("input '{name}': {e}"),
                            step_id: Some(step_id.to_string()),
                        }
                        .to_string(),
                    )
                }
            },
            other => other.clone(),
        };
        child_inputs.insert(name.clone(), evaluated);
    }

    let runner = WorkflowRunner::from_context(Arc::clone(engine));
    // Boxed: the child run re-enters the executor stack.
    let child = Box::pin(runner.run(
        &child_workflow,
        RunOptions {
            inputs: Value::Object(child_inputs),
            resume_run_id: None,
            cancel: Some(cancel.child_token()),
        },
    ))
    .await;

    let child = match child {
        Ok(child) => child,
        Err(e) => return StepResult::failed(format!("sub-workflow failed to start: {e}")),
    };

    // The child run id goes to the audit trail so operators can roll up (or
    // roll back) nested runs.
    audit(
        engine,
        &EngineEvent::SubWorkflowStarted {
            run_id: run_ctx.run_id,
            step_id: step_id.to_string(),
            child_run_id: child.run_id,
        },
    )
    .await;

    match child.status {
        RunStatus::Completed => {
            let outputs = map_outputs(child.outputs.unwrap_or(json!({})), output_mapping);
            StepResult::success(json!({
                "run_id": child.run_id,
                "outputs": outputs,
            }))
        }
        RunStatus::Paused => StepResult::suspended(json!({
            "run_id": child.run_id,
            "event": format!("sub_workflow:{}", child.run_id),
        })),
        _ => StepResult::failed(format!(
            "sub-workflow '{child_name}' {}: {}",
            child.status.as_str(),
            child.error.unwrap_or_else(|| "unknown error".to_string())
        )),
    }
}

/// Rename child output keys; unmapped keys pass through unchanged.
fn map_outputs(outputs: Value, mapping: &HashMap<String, String>) -> Value {
    let Value::Object(map) = outputs else {
        return outputs;
    };
    let mapped: Map<String, Value> = map
        .into_iter()
        .map(|(key, value)| {
            let renamed = mapping.get(&key).cloned().unwrap_or(key);
            (renamed, value)
        })
        .collect();
    Value::Object(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_outputs_renames_and_defaults() {
        let mapping: HashMap<String, String> =
            [("result".to_string(), "summary".to_string())].into();
        let mapped = map_outputs(json!({"result": "ok", "count": 3}), &mapping);
        assert_eq!(mapped, json!({"summary": "ok", "count": 3}));
    }

    #[test]
    fn test_map_outputs_non_object_passthrough() {
        let mapped = map_outputs(json!("scalar"), &HashMap::new());
        assert_eq!(mapped, json!("scalar"));
    }
}
