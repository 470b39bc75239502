//! Step execution: the typed dispatcher and the shared prelude.
//!
//! Every step runs through the same bracket: evaluate the `if` gate, fan out
//! on `foreach`, build the expression context, acquire a pool slot, run the
//! kind-specific handler under the step timeout, validate the output schema,
//! redact, persist. Kind-specific code only produces the raw [`StepResult`];
//! everything else lives here.

mod dispatch;
pub mod foreach;
pub mod human;
pub mod join;
pub mod llm;
pub mod memory;
pub mod schema;
pub mod shell;
pub mod sleep;
pub mod sub_workflow;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use strand_types::error::EngineError;
use strand_types::event::{EngineEvent, EventRecord};
use strand_types::workflow::{
    Step, StepConfig, StepExecution, StepStatus, TokenUsage, Workflow,
};
use tokio_util::sync::CancellationToken;

use crate::context::{RunContext, StepContext};
use crate::pool;
use crate::resilience::with_timeout;
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Default step timeout when none is configured (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

/// Error text recorded for cooperatively aborted executions.
pub const CANCELED: &str = "Step canceled";

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// The uniform result every executor produces.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    pub output: Value,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Per-iteration contexts, set by the foreach engine.
    pub items: Option<Vec<StepContext>>,
    /// Element-wise merged outputs, set by the foreach engine.
    pub merged_outputs: Option<Value>,
    /// The evaluated item list, set by the foreach engine. Persisted on the
    /// parent row as the hydration hint.
    pub foreach_items: Option<Value>,
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: StepStatus::Success,
            output,
            error: None,
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    }

    pub fn failed_with_output(error: impl Into<String>, output: Value) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            error: Some(error.into()),
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            output: Value::Null,
            error: None,
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    }

    pub fn suspended(output: Value) -> Self {
        Self {
            status: StepStatus::Suspended,
            output,
            error: None,
            usage: None,
            items: None,
            merged_outputs: None,
            foreach_items: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Build the context entry downstream expressions will see.
    pub fn to_step_context(&self) -> StepContext {
        let outputs = match &self.merged_outputs {
            Some(merged) => merged.clone(),
            None if self.output.is_object() => self.output.clone(),
            None => json!({}),
        };
        StepContext {
            output: self.output.clone(),
            outputs,
            status: self.status,
            error: self.error.clone(),
            items: self.items.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// One persisted attempt
// ---------------------------------------------------------------------------

/// Run one attempt of a step: create its execution record, run the prelude
/// and the kind-specific handler, persist the outcome.
///
/// Returns `Err` only for store failures; execution failures come back as a
/// failed [`StepResult`] for the recovery wrappers to inspect.
pub async fn run_attempt<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    cancel: &CancellationToken,
    attempt: u32,
    resume: Option<&Value>,
) -> Result<StepResult, EngineError> {
    let store = &engine.store;
    let exec = StepExecution::pending(run_ctx.run_id, &step.id, None, attempt);
    store.create_step(&exec).await?;

    // Gate before starting: a skipped step never transitions to running.
    if let Some(gate) = &step.when {
        let expr_ctx = run_ctx.expression_context(None, None);
        match engine.evaluator.evaluate_bool(gate, &expr_ctx) {
            Ok(true) => {}
            Ok(false) => {
                store
                    .complete_step(&exec.id, StepStatus::Skipped, None, None, None)
                    .await?;
                let event = EngineEvent::StepSkipped {
                    run_id: run_ctx.run_id,
                    step_id: step.id.clone(),
                };
                engine.bus.publish(event.clone());
                audit(engine, &event).await;
                return Ok(StepResult::skipped());
            }
            Err(e) => {
                let message = EngineError::Expression {
                    message: e.to_string(),
                    step_id: Some(step.id.clone()),
                }
                .to_string();
                store
                    .complete_step(&exec.id, StepStatus::Failed, None, Some(&message), None)
                    .await?;
                return Ok(StepResult::failed(message));
            }
        }
    }

    store.start_step(&exec.id).await?;
    let started_event = EngineEvent::StepStarted {
        run_id: run_ctx.run_id,
        step_id: step.id.clone(),
        kind: step.kind().to_string(),
        iteration: None,
        attempt,
    };
    engine.bus.publish(started_event.clone());
    audit(engine, &started_event).await;
    let started = std::time::Instant::now();

    let mut result = if step.foreach.is_some() {
        foreach::run_foreach(engine, workflow, run_ctx, step, &exec.id, cancel).await?
    } else {
        execute_single(engine, workflow, run_ctx, step, None, None, cancel, resume).await
    };

    result.output = engine.redactor.redact_value(&result.output);
    if let Some(error) = &result.error {
        result.error = Some(engine.redactor.redact(error));
    }

    store
        .complete_step(
            &exec.id,
            result.status,
            persisted_output(step, &result).as_ref(),
            result.error.as_deref(),
            result.usage.as_ref(),
        )
        .await?;

    let duration_ms = started.elapsed().as_millis() as u64;
    let terminal_event = match result.status {
        StepStatus::Success | StepStatus::Skipped => Some(EngineEvent::StepCompleted {
            run_id: run_ctx.run_id,
            step_id: step.id.clone(),
            iteration: None,
            duration_ms,
        }),
        StepStatus::Failed => Some(EngineEvent::StepFailed {
            run_id: run_ctx.run_id,
            step_id: step.id.clone(),
            iteration: None,
            error: result.error.clone().unwrap_or_default(),
            will_retry: false,
        }),
        StepStatus::Suspended => {
            let event_name = result.output["event"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            Some(EngineEvent::StepSuspended {
                run_id: run_ctx.run_id,
                step_id: step.id.clone(),
                event_name,
            })
        }
        StepStatus::Pending | StepStatus::Running => None,
    };
    if let Some(event) = terminal_event {
        engine.bus.publish(event.clone());
        audit(engine, &event).await;
    }

    Ok(result)
}

/// What goes into the execution row's output column. Foreach parents keep
/// only the hydration hint; the aggregate is rebuilt from iteration rows.
fn persisted_output(step: &Step, result: &StepResult) -> Option<Value> {
    if step.foreach.is_some() {
        let hint = result.foreach_items.clone().unwrap_or(Value::Null);
        return Some(json!({ strand_types::workflow::FOREACH_ITEMS_KEY: hint }));
    }
    Some(result.output.clone())
}

// ---------------------------------------------------------------------------
// Single execution (no foreach)
// ---------------------------------------------------------------------------

/// Execute one step body (or one foreach iteration): input-schema check,
/// pool slot, timeout, typed dispatch, output-schema check.
///
/// Returns an explicitly boxed, `Send`-annotated future (rather than being an
/// `async fn`) so its opaque return type doesn't cyclically depend on
/// `foreach::run_foreach`'s opaque type across the module boundary, which
/// otherwise defeats rustc's auto-trait (`Send`) inference for recursive
/// call graphs.
#[allow(clippy::too_many_arguments)]
pub fn execute_single<'a, S: StateStore + 'static>(
    engine: &'a Arc<EngineContext<S>>,
    workflow: &'a Workflow,
    run_ctx: &'a RunContext,
    step: &'a Step,
    item: Option<&'a Value>,
    index: Option<usize>,
    cancel: &'a CancellationToken,
    resume: Option<&'a Value>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = StepResult> + Send + 'a>> {
    Box::pin(execute_single_inner(
        engine, workflow, run_ctx, step, item, index, cancel, resume,
    ))
}

#[allow(clippy::too_many_arguments)]
async fn execute_single_inner<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    item: Option<&Value>,
    index: Option<usize>,
    cancel: &CancellationToken,
    resume: Option<&Value>,
) -> StepResult {
    if cancel.is_cancelled() {
        return StepResult::failed(CANCELED);
    }

    let expr_ctx = run_ctx.expression_context(item, index);

    if let Some(input_schema) = &step.input_schema {
        let descriptor = input_descriptor(engine, step, &expr_ctx);
        if let Err(violation) = schema::validate(input_schema, &descriptor) {
            return StepResult::failed(
                EngineError::Schema {
                    message: violation,
                    step_id: Some(step.id.clone()),
                }
                .to_string(),
            );
        }
    }

    // Pool slot: the configured pool, or a per-kind default pool.
    let pool_name = step.pool.clone().unwrap_or_else(|| step.kind().to_string());
    let permit = match engine
        .pools
        .acquire(
            &pool_name,
            pool::AcquireOptions {
                priority: 0,
                signal: Some(cancel.clone()),
            },
        )
        .await
    {
        Ok(permit) => permit,
        Err(pool::PoolError::Aborted) => return StepResult::failed(CANCELED),
        Err(pool::PoolError::Closed(name)) => {
            return StepResult::failed(format!("resource error: pool '{name}' is closed"))
        }
    };

    let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS));
    let body_cancel = cancel.child_token();

    let executed = with_timeout(
        timeout,
        &body_cancel,
        dispatch::dispatch(engine, workflow, run_ctx, step, &expr_ctx, &body_cancel, resume),
    )
    .await;
    drop(permit);

    let mut result = match executed {
        Ok(result) => result,
        Err(elapsed) => StepResult::failed(
            EngineError::Timeout {
                timeout_ms: elapsed.timeout_ms,
                step_id: Some(step.id.clone()),
            }
            .to_string(),
        ),
    };

    if result.status == StepStatus::Success {
        if let Some(output_schema) = &step.output_schema {
            if let Err(violation) = schema::validate(output_schema, &result.output) {
                result = StepResult::failed_with_output(
                    EngineError::Schema {
                        message: violation,
                        step_id: Some(step.id.clone()),
                    }
                    .to_string(),
                    result.output,
                );
            }
        }
    }

    result
}

/// The evaluated, kind-specific payload that `input_schema` checks.
fn input_descriptor<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    step: &Step,
    expr_ctx: &Value,
) -> Value {
    let eval = |tpl: &str| {
        engine
            .evaluator
            .evaluate(tpl, expr_ctx)
            .unwrap_or(Value::Null)
    };
    match &step.config {
        StepConfig::Shell { run, .. } => json!({ "run": eval(run) }),
        StepConfig::Llm { prompt, .. } => json!({ "prompt": eval(prompt) }),
        StepConfig::Human { prompt, .. } => json!({ "prompt": eval(prompt) }),
        StepConfig::Memory { text, query, .. } => json!({
            "text": text.as_deref().map(eval),
            "query": query.as_deref().map(eval),
        }),
        StepConfig::SubWorkflow { inputs, .. } => {
            let evaluated: serde_json::Map<String, Value> = inputs
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => eval(s),
                        other => other.clone(),
                    };
                    (k.clone(), value)
                })
                .collect();
            Value::Object(evaluated)
        }
        StepConfig::Sleep { duration_ms } => json!({ "duration_ms": duration_ms }),
        StepConfig::Join {} | StepConfig::Dynamic { .. } => json!({}),
    }
}

/// Append a durable audit row, logging (rather than failing) on store errors:
/// audit writes must never take an otherwise healthy step down.
pub(crate) async fn audit<S: StateStore>(engine: &Arc<EngineContext<S>>, event: &EngineEvent) {
    let record = EventRecord::from_engine_event(event);
    if let Err(e) = engine.store.append_event(&record).await {
        tracing::warn!(error = %e, kind = event.kind(), "failed to append audit event");
    }
}
