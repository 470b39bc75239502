//! Foreach engine: fan an iterable out into indexed child executions.
//!
//! Each iteration is a copy of the step with `foreach` and `concurrency`
//! removed and `item`/`index` bound in its context, persisted as its own
//! execution row (`iteration = i`). There is no fail-fast: every iteration
//! runs to a terminal status, then the parent aggregates by ascending index.
//! Already-completed iterations (from a resume or a prior attempt) are
//! reused, not re-executed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use strand_types::error::EngineError;
use strand_types::event::EngineEvent;
use strand_types::workflow::{
    Step, StepExecution, StepStatus, TokenUsage, Workflow, FOREACH_ITEMS_KEY,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{execute_single, StepResult};
use crate::context::{RunContext, StepContext};
use crate::runner::EngineContext;
use crate::store::StateStore;

pub async fn run_foreach<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    parent_exec_id: &Uuid,
    cancel: &CancellationToken,
) -> Result<StepResult, EngineError> {
    let foreach = step.foreach.as_deref().expect("foreach step");

    let expr_ctx = run_ctx.expression_context(None, None);
    let items = match engine.evaluator.evaluate(foreach, &expr_ctx) {
        Ok(Value::Array(items)) => items,
        Ok(other) => {
            return Ok(StepResult::failed(format!(
                "foreach expression must evaluate to an array, got {}",
                type_of(&other)
            )))
        }
        Err(e) => {
            return Ok(StepResult::failed(
                EngineError::Expression {
                    message: e.to_string(),
                    step_id: Some(step.id.clone()),
                }
                .to_string(),
            ))
        }
    };

    // Persist the item list on the parent row while it is still running, so
    // an interrupted run knows how many iterations to expect on hydration.
    engine
        .store
        .complete_step(
            parent_exec_id,
            StepStatus::Running,
            Some(&json!({ FOREACH_ITEMS_KEY: items })),
            None,
            None,
        )
        .await?;

    // Latest execution row per iteration index (retries leave older rows).
    let mut latest: HashMap<u32, StepExecution> = HashMap::new();
    let mut attempts: HashMap<u32, u32> = HashMap::new();
    for exec in engine
        .store
        .get_step_iterations(&run_ctx.run_id, &step.id, true)
        .await?
    {
        if let Some(i) = exec.iteration {
            *attempts.entry(i).or_default() += 1;
            latest.insert(i, exec);
        }
    }

    // Iterations run as copies of the step minus the fan-out fields.
    let mut iteration_step = step.clone();
    iteration_step.foreach = None;
    iteration_step.concurrency = None;

    let limit = step
        .concurrency
        .map(|c| c.max(1) as usize)
        .unwrap_or_else(|| items.len().max(1));
    let semaphore = Arc::new(Semaphore::new(limit));

    let mut slots: Vec<Option<StepContext>> = vec![None; items.len()];
    let mut usage = TokenUsage::default();
    let mut join_set: JoinSet<(usize, StepResult)> = JoinSet::new();

    for (index, item) in items.iter().enumerate() {
        // Reuse completed work from a resume or an earlier attempt.
        if let Some(prior) = latest.get(&(index as u32)) {
            if prior.status.is_completed() {
                let output = prior.output.clone().unwrap_or(Value::Null);
                slots[index] = Some(StepContext {
                    output: output.clone(),
                    outputs: if output.is_object() {
                        output
                    } else {
                        json!({})
                    },
                    status: prior.status,
                    error: prior.error.clone(),
                    items: None,
                });
                continue;
            }
        }
        let attempt = attempts.get(&(index as u32)).copied().unwrap_or(0) + 1;

        let engine = Arc::clone(engine);
        let workflow = workflow.clone();
        let run_ctx = run_ctx.clone();
        let iteration_step = iteration_step.clone();
        let item = item.clone();
        let cancel = cancel.clone();
        let semaphore = Arc::clone(&semaphore);

        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, StepResult::failed(super::CANCELED)),
            };
            let result = run_iteration(
                &engine,
                &workflow,
                &run_ctx,
                &iteration_step,
                index,
                &item,
                attempt,
                &cancel,
            )
            .await;
            (index, result)
        });
    }

    // No fail-fast: collect every iteration.
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(u) = result.usage {
                    usage.add(u);
                }
                slots[index] = Some(result.to_step_context());
            }
            Err(e) => {
                tracing::error!(step_id = step.id.as_str(), error = %e, "iteration task panicked");
            }
        }
    }

    Ok(aggregate(step, &items, slots, usage))
}

#[allow(clippy::too_many_arguments)]
async fn run_iteration<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    index: usize,
    item: &Value,
    attempt: u32,
    cancel: &CancellationToken,
) -> StepResult {
    let exec = StepExecution::pending(run_ctx.run_id, &step.id, Some(index as u32), attempt);
    if let Err(e) = engine.store.create_step(&exec).await {
        return StepResult::failed(format!("failed to record iteration: {e}"));
    }

    // Per-iteration gate with item/index bound.
    if let Some(gate) = &step.when {
        let expr_ctx = run_ctx.expression_context(Some(item), Some(index));
        match engine.evaluator.evaluate_bool(gate, &expr_ctx) {
            Ok(true) => {}
            Ok(false) => {
                let _ = engine
                    .store
                    .complete_step(&exec.id, StepStatus::Skipped, None, None, None)
                    .await;
                return StepResult::skipped();
            }
            Err(e) => {
                let message = format!("iteration gate failed: {e}");
                let _ = engine
                    .store
                    .complete_step(&exec.id, StepStatus::Failed, None, Some(&message), None)
                    .await;
                return StepResult::failed(message);
            }
        }
    }

    if let Err(e) = engine.store.start_step(&exec.id).await {
        return StepResult::failed(format!("failed to start iteration: {e}"));
    }
    engine.bus.publish(EngineEvent::StepStarted {
        run_id: run_ctx.run_id,
        step_id: step.id.clone(),
        kind: step.kind().to_string(),
        iteration: Some(index as u32),
        attempt,
    });

    let mut result = execute_single(
        engine,
        workflow,
        run_ctx,
        step,
        Some(item),
        Some(index),
        cancel,
        None,
    )
    .await;

    result.output = engine.redactor.redact_value(&result.output);
    if let Some(error) = &result.error {
        result.error = Some(engine.redactor.redact(error));
    }

    if let Err(e) = engine
        .store
        .complete_step(
            &exec.id,
            result.status,
            Some(&result.output),
            result.error.as_deref(),
            result.usage.as_ref(),
        )
        .await
    {
        return StepResult::failed(format!("failed to record iteration result: {e}"));
    }

    result
}

/// Assemble the parent result: output array by ascending index, element-wise
/// merged `outputs`, worst-status derivation, aggregated errors.
fn aggregate(
    step: &Step,
    items: &[Value],
    slots: Vec<Option<StepContext>>,
    usage: TokenUsage,
) -> StepResult {
    let contexts: Vec<StepContext> = slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| StepContext::failed("iteration lost")))
        .collect();

    let outputs: Vec<Value> = contexts.iter().map(|c| c.output.clone()).collect();

    // Element-wise merge when every iteration produced an object; later
    // iterations overwrite earlier keys.
    let all_objects = !contexts.is_empty() && contexts.iter().all(|c| c.output.is_object());
    let merged = if all_objects {
        let mut merged = Map::new();
        for context in &contexts {
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

    // Anything short of success/skipped fails the parent; fan-out iterations
    // have no suspension path, so a suspended iteration is a defect, not a
    // pause.
    let errors: Vec<String> = contexts
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.status.is_completed())
        .map(|(i, c)| {
            format!(
                "iteration {i}: {}",
                c.error.as_deref().unwrap_or("did not complete")
            )
        })
        .collect();

    let mut result = if errors.is_empty() {
        StepResult::success(Value::Array(outputs))
    } else {
        let aggregate = EngineError::Aggregate {
            step_id: step.id.clone(),
            total: contexts.len(),
            errors: errors.clone(),
        };
        StepResult {
            status: StepStatus::Failed,
            output: Value::Array(outputs),
            error: Some(format!("{aggregate}: {}", errors.join("; "))),
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    };

    result.usage = Some(usage);
    result.items = Some(contexts);
    result.merged_outputs = Some(merged);
    result.foreach_items = Some(Value::Array(items.to_vec()));
    result
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
