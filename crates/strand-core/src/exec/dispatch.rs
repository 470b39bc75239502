//! Kind-specific dispatch, split into its own submodule so the recursive
//! `Dynamic` branch's opaque future type doesn't cycle with the rest of
//! `exec` (notably `foreach`, which also calls back into this module).

use std::sync::Arc;

use serde_json::Value;
use strand_types::error::EngineError;
use strand_types::workflow::{Step, StepConfig, Workflow};
use tokio_util::sync::CancellationToken;

use super::{human, join, llm, memory, shell, sleep, sub_workflow, StepResult};
use crate::context::RunContext;
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Kind-specific dispatch. A shared prelude means each arm only produces the
/// raw result.
#[allow(clippy::too_many_arguments)]
pub(super) async fn dispatch<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    expr_ctx: &Value,
    cancel: &CancellationToken,
    resume: Option<&Value>,
) -> StepResult {
    match &step.config {
        StepConfig::Shell {
            run,
            env,
            workdir,
            max_output_bytes,
        } => {
            shell::run_shell(
                engine,
                run,
                env,
                workdir.as_deref(),
                *max_output_bytes,
                expr_ctx,
                cancel,
            )
            .await
        }
        StepConfig::Sleep { duration_ms } => sleep::run_sleep(*duration_ms, cancel).await,
        StepConfig::Human { prompt, event } => {
            human::run_human(
                engine,
                run_ctx,
                &step.id,
                prompt,
                event.as_deref(),
                expr_ctx,
                resume,
            )
            .await
        }
        StepConfig::Memory {
            op,
            text,
            query,
            limit,
            metadata,
        } => {
            memory::run_memory(
                engine,
                *op,
                text.as_deref(),
                query.as_deref(),
                *limit,
                metadata.as_ref(),
                expr_ctx,
            )
            .await
        }
        StepConfig::SubWorkflow {
            workflow: child,
            inputs,
            output_mapping,
        } => {
            sub_workflow::run_sub_workflow(
                engine,
                run_ctx,
                &step.id,
                child,
                inputs,
                output_mapping,
                expr_ctx,
                cancel,
            )
            .await
        }
        StepConfig::Join {} => join::run_join(step),
        StepConfig::Llm { .. } => {
            llm::run_llm(engine, run_ctx, step, expr_ctx, cancel, resume).await
        }
        StepConfig::Dynamic { template } => {
            let resolved = match resolve_dynamic(engine, step, template, expr_ctx) {
                Ok(resolved) => resolved,
                Err(message) => return StepResult::failed(message),
            };
            Box::pin(dispatch(
                engine, workflow, run_ctx, &resolved, expr_ctx, cancel, resume,
            ))
            .await
        }
    }
}

/// Evaluate a dynamic step's template into a concrete step under the frozen
/// identity rules: the template cannot rename the step or re-enter dynamic
/// dispatch.
fn resolve_dynamic<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    step: &Step,
    template: &Value,
    expr_ctx: &Value,
) -> Result<Step, String> {
    if template.get("id").is_some() {
        return Err(EngineError::Security {
            message: "dynamic template may not set 'id'".to_string(),
            step_id: Some(step.id.clone()),
        }
        .to_string());
    }

    let evaluated = evaluate_tree(engine, template, expr_ctx)?;
    let config: StepConfig = serde_json::from_value(evaluated)
        .map_err(|e| format!("dynamic template is not a valid step config: {e}"))?;
    if matches!(config, StepConfig::Dynamic { .. }) {
        return Err(EngineError::Security {
            message: "dynamic template may not nest dynamic steps".to_string(),
            step_id: Some(step.id.clone()),
        }
        .to_string());
    }

    let mut resolved = step.clone();
    resolved.config = config;
    Ok(resolved)
}

fn evaluate_tree<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    value: &Value,
    expr_ctx: &Value,
) -> Result<Value, String> {
    match value {
        Value::String(s) => engine
            .evaluator
            .evaluate(s, expr_ctx)
            .map_err(|e| e.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|v| evaluate_tree(engine, v, expr_ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| evaluate_tree(engine, v, expr_ctx).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
