//! The runner: top-level orchestration of one workflow run.
//!
//! Builds the scheduler (seeded from hydration on resume), drains runnable
//! steps into an in-flight task set bounded by the workflow's concurrency,
//! wraps every executor in the recovery chain, and commits the evaluated
//! workflow outputs when the DAG drains. Shared collaborators live on
//! [`EngineContext`] and are threaded explicitly; the engine has no global
//! state beyond the process-wide memory table behind the vector-store seam.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use strand_types::error::EngineError;
use strand_types::event::{EngineEvent, EventRecord};
use strand_types::workflow::{Run, RunStatus, StepStatus, Workflow};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{RunContext, StepContext};
use crate::event::EventBus;
use crate::exec::StepResult;
use crate::expr::Evaluator;
use crate::hydrate::{self, HydratedState};
use crate::llm::{AgentProfile, BoxLanguageModel, Prompter, ToolRegistry};
use crate::mcp::McpClient;
use crate::memory::{Embedder, VectorStore};
use crate::pool::{PoolManager, DEFAULT_POOL_CAPACITY};
use crate::recovery;
use crate::redact::Redactor;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use crate::scheduler::{validate_dag, DagScheduler};
use crate::store::StateStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-level knobs, threaded through the context instead of any global.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// First-argv-token denylist for shell steps.
    pub denylist: Vec<String>,
    /// Capacity for pools not named in a workflow's `pools` map.
    pub default_pool_capacity: u32,
    /// Default cap on accumulated shell output bytes.
    pub default_shell_output_bytes: usize,
    /// Values always masked, regardless of the secrets map.
    pub forced_secrets: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            denylist: vec![],
            default_pool_capacity: DEFAULT_POOL_CAPACITY,
            default_shell_output_bytes: crate::exec::shell::DEFAULT_MAX_OUTPUT_BYTES,
            forced_secrets: vec![],
        }
    }
}

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// Everything a run needs, owned in one place and shared by `Arc`.
pub struct EngineContext<S: StateStore> {
    pub store: Arc<S>,
    pub model: Option<Arc<BoxLanguageModel>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub vector_store: Option<Arc<dyn VectorStore>>,
    pub mcp: HashMap<String, Arc<dyn McpClient>>,
    pub tools: ToolRegistry,
    pub agents: HashMap<String, AgentProfile>,
    /// Workflow registry for `sub_workflow` resolution.
    pub workflows: HashMap<String, Workflow>,
    pub prompter: Option<Arc<dyn Prompter>>,
    pub pools: PoolManager,
    /// Breaker guarding model calls; trips after consecutive adapter
    /// failures and probes again after the reset timeout.
    pub model_breaker: Arc<CircuitBreaker>,
    /// Optional token bucket applied to model calls.
    pub model_limiter: Option<RateLimiter>,
    pub bus: EventBus,
    pub redactor: Redactor,
    pub evaluator: Evaluator,
    pub secrets: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub config: EngineConfig,
}

impl<S: StateStore> EngineContext<S> {
    /// Build a context with the given store, secrets, and config; every
    /// collaborator starts empty and is attached with the `with_*` methods.
    pub fn new(store: Arc<S>, secrets: HashMap<String, String>, config: EngineConfig) -> Self {
        let redactor = Redactor::new(&secrets, &config.forced_secrets);
        let pools = PoolManager::new(HashMap::new(), config.default_pool_capacity);
        let bus = EventBus::default();
        let breaker_bus = bus.clone();
        let model_breaker = Arc::new(
            CircuitBreaker::new("model", CircuitBreakerConfig::default()).with_observer(
                Arc::new(move |name, state| {
                    breaker_bus.publish(EngineEvent::BreakerStateChanged {
                        name: name.to_string(),
                        state: state.as_str().to_string(),
                    });
                }),
            ),
        );
        Self {
            store,
            model: None,
            embedder: None,
            vector_store: None,
            mcp: HashMap::new(),
            tools: ToolRegistry::new(),
            agents: HashMap::new(),
            workflows: HashMap::new(),
            prompter: None,
            pools,
            model_breaker,
            model_limiter: None,
            bus,
            redactor,
            evaluator: Evaluator::new(),
            secrets,
            env: HashMap::new(),
            config,
        }
    }

    pub fn with_model(mut self, model: BoxLanguageModel) -> Self {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(vectors);
        self
    }

    pub fn with_mcp(mut self, client: Arc<dyn McpClient>) -> Self {
        self.mcp.insert(client.name().to_string(), client);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_agent(mut self, agent: AgentProfile) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflows.insert(workflow.name.clone(), workflow);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_model_limiter(mut self, limiter: RateLimiter) -> Self {
        self.model_limiter = Some(limiter);
        self
    }
}

// ---------------------------------------------------------------------------
// Run options / result
// ---------------------------------------------------------------------------

/// How to launch (or relaunch) a run.
pub struct RunOptions {
    pub inputs: Value,
    /// Resume an interrupted run instead of creating a new one.
    pub resume_run_id: Option<Uuid>,
    /// Cancellation token propagated to every in-flight executor.
    pub cancel: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            inputs: json!({}),
            resume_run_id: None,
            cancel: None,
        }
    }
}

/// The structured result of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    /// Final step contexts (post-redaction), keyed by step id.
    pub steps: HashMap<String, StepContext>,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflows against one [`EngineContext`].
pub struct WorkflowRunner<S: StateStore> {
    engine: Arc<EngineContext<S>>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<S: StateStore + 'static> WorkflowRunner<S> {
    pub fn new(engine: EngineContext<S>) -> Self {
        Self::from_context(Arc::new(engine))
    }

    pub fn from_context(engine: Arc<EngineContext<S>>) -> Self {
        Self {
            engine,
            cancel_tokens: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext<S>> {
        &self.engine
    }

    /// Cancel a run started by this runner.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.cancel_tokens.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute (or resume) a workflow to completion.
    ///
    /// Only configuration and store failures surface as `Err`; per-step
    /// failures are folded into the run's final status.
    pub async fn run(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        validate_dag(&workflow.steps)?;
        for (name, capacity) in &workflow.pools {
            self.engine.pools.register(name, *capacity);
        }

        let cancel = options.cancel.unwrap_or_default();
        let store = &self.engine.store;

        // Hydrate or create.
        let (run_id, mut run_ctx, completed, mut resumable, still_suspended) =
            match options.resume_run_id {
                Some(run_id) => {
                    let HydratedState {
                        run,
                        steps,
                        completed,
                        resumable,
                        still_suspended,
                    } = hydrate::hydrate_run(store.as_ref(), workflow, &run_id).await?;

                    let mut run_ctx = RunContext::new(
                        run.id,
                        &workflow.name,
                        run.inputs.clone(),
                        self.engine.secrets.clone(),
                        self.engine.env.clone(),
                    );
                    run_ctx.steps = steps;

                    store
                        .update_run_status(&run_id, RunStatus::Running, None)
                        .await?;
                    tracing::info!(
                        run_id = %run_id,
                        workflow = workflow.name.as_str(),
                        completed = completed.len(),
                        "resuming run"
                    );
                    (run_id, run_ctx, completed, resumable, still_suspended)
                }
                None => {
                    if let Some(schema) = &workflow.inputs {
                        if let Err(violation) =
                            crate::exec::schema::validate(schema, &options.inputs)
                        {
                            return Err(EngineError::Config(format!(
                                "run inputs do not match the workflow's input schema: {violation}"
                            )));
                        }
                    }
                    let run = Run {
                        id: Uuid::now_v7(),
                        workflow_name: workflow.name.clone(),
                        status: RunStatus::Pending,
                        inputs: options.inputs.clone(),
                        outputs: None,
                        error: None,
                        started_at: Utc::now(),
                        ended_at: None,
                    };
                    store.create_run(&run).await?;
                    store
                        .update_run_status(&run.id, RunStatus::Running, None)
                        .await?;
                    tracing::info!(
                        run_id = %run.id,
                        workflow = workflow.name.as_str(),
                        "starting run"
                    );
                    let run_ctx = RunContext::new(
                        run.id,
                        &workflow.name,
                        run.inputs.clone(),
                        self.engine.secrets.clone(),
                        self.engine.env.clone(),
                    );
                    (run.id, run_ctx, HashSet::new(), HashMap::new(), HashMap::new())
                }
            };

        self.cancel_tokens.insert(run_id, cancel.clone());
        self.emit(&EngineEvent::RunStarted {
            run_id,
            workflow_name: workflow.name.clone(),
        })
        .await;
        let run_start = std::time::Instant::now();

        let mut scheduler = DagScheduler::new(&workflow.steps, &completed)?;
        let global_cap = workflow.concurrency.map(|c| c.max(1) as usize);

        let mut join_set: JoinSet<(String, Result<StepResult, EngineError>)> = JoinSet::new();
        let mut suspended: HashMap<String, Value> = HashMap::new();
        let mut first_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() && join_set.is_empty() {
                break;
            }

            if !cancel.is_cancelled() {
                for id in scheduler.runnable(join_set.len(), global_cap) {
                    scheduler.start(&id);

                    // A suspension whose event has not arrived parks again
                    // without re-executing.
                    if let Some(output) = still_suspended.get(&id) {
                        if !resumable.contains_key(&id) {
                            suspended.insert(id.clone(), output.clone());
                            scheduler.mark_failed(&id);
                            continue;
                        }
                    }

                    let step = workflow
                        .step(&id)
                        .expect("scheduler only emits known steps")
                        .clone();
                    let engine = Arc::clone(&self.engine);
                    let wf = workflow.clone();
                    let snapshot = run_ctx.clone();
                    let token = cancel.clone();
                    let resume = resumable.remove(&id);

                    join_set.spawn(async move {
                        let result = recovery::run_with_recovery(
                            &engine,
                            &wf,
                            &snapshot,
                            &step,
                            &token,
                            resume.as_ref(),
                        )
                        .await;
                        (step.id, result)
                    });
                }
            }

            if scheduler.is_complete() && join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((id, result))) => {
                    // Store failures are fatal: abort the run, not the step.
                    let result = match result {
                        Ok(result) => result,
                        Err(e) => {
                            self.cancel_tokens.remove(&run_id);
                            let _ = store
                                .update_run_status(&run_id, RunStatus::Failed, Some(&e.to_string()))
                                .await;
                            return Err(e);
                        }
                    };
                    match result.status {
                        StepStatus::Success | StepStatus::Skipped => {
                            run_ctx.set_step(&id, result.to_step_context());
                            scheduler.mark_complete(&id);
                        }
                        StepStatus::Suspended => {
                            suspended.insert(id.clone(), result.output.clone());
                            scheduler.mark_failed(&id);
                            scheduler.drain_unreachable();
                        }
                        _ => {
                            if first_error.is_none() {
                                first_error = Some(
                                    result
                                        .error
                                        .clone()
                                        .unwrap_or_else(|| format!("step '{id}' failed")),
                                );
                            }
                            run_ctx.set_step(&id, result.to_step_context());
                            scheduler.mark_failed(&id);
                            let unreachable = scheduler.drain_unreachable();
                            if !unreachable.is_empty() {
                                tracing::debug!(
                                    run_id = %run_id,
                                    failed = id.as_str(),
                                    unreachable = ?unreachable,
                                    "dependents will not run"
                                );
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(run_id = %run_id, error = %e, "step task panicked");
                    if first_error.is_none() {
                        first_error = Some(format!("step task panicked: {e}"));
                    }
                }
                None => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    scheduler.drain_unreachable();
                    if scheduler.is_complete() {
                        break;
                    }
                    if scheduler.runnable(0, global_cap).is_empty() {
                        // Nothing in flight and nothing can start: a stall
                        // here would loop forever, so fail the run instead.
                        first_error.get_or_insert_with(|| {
                            "scheduler stalled with unrunnable steps".to_string()
                        });
                        break;
                    }
                }
            }
        }

        self.cancel_tokens.remove(&run_id);

        // Final status and outputs.
        let (status, outputs, error) = if cancel.is_cancelled() {
            (
                RunStatus::Failed,
                None,
                Some(first_error.unwrap_or_else(|| "Run canceled".to_string())),
            )
        } else if let Some(error) = first_error {
            (RunStatus::Failed, None, Some(error))
        } else if !suspended.is_empty() {
            let waiting: Vec<&String> = suspended.keys().collect();
            (
                RunStatus::Paused,
                None,
                Some(format!("suspended steps: {waiting:?}")),
            )
        } else {
            match self.evaluate_outputs(workflow, &run_ctx) {
                Ok(outputs) => (RunStatus::Completed, Some(outputs), None),
                Err(e) => (RunStatus::Failed, None, Some(e.to_string())),
            }
        };

        if let Some(outputs) = &outputs {
            store.set_run_outputs(&run_id, outputs).await?;
        }
        store
            .update_run_status(&run_id, status, error.as_deref())
            .await?;

        match status {
            RunStatus::Completed => {
                self.emit(&EngineEvent::RunCompleted {
                    run_id,
                    workflow_name: workflow.name.clone(),
                    duration_ms: run_start.elapsed().as_millis() as u64,
                })
                .await;
            }
            RunStatus::Failed => {
                self.emit(&EngineEvent::RunFailed {
                    run_id,
                    workflow_name: workflow.name.clone(),
                    error: error.clone().unwrap_or_default(),
                })
                .await;
            }
            _ => {}
        }

        tracing::info!(
            run_id = %run_id,
            status = status.as_str(),
            "run finished"
        );

        Ok(RunResult {
            run_id,
            status,
            outputs,
            error,
            steps: run_ctx.steps,
        })
    }

    /// Evaluate `workflow.outputs` against the final context, redacting.
    fn evaluate_outputs(
        &self,
        workflow: &Workflow,
        run_ctx: &RunContext,
    ) -> Result<Value, EngineError> {
        let expr_ctx = run_ctx.expression_context(None, None);
        let mut outputs = Map::new();
        for (name, expr) in &workflow.outputs {
            let value = self
                .engine
                .evaluator
                .evaluate(expr, &expr_ctx)
                .map_err(|e| EngineError::Expression {
                    message: format!("output '{name}': {e}"),
                    step_id: None,
                })?;
            outputs.insert(name.clone(), self.engine.redactor.redact_value(&value));
        }
        Ok(Value::Object(outputs))
    }

    async fn emit(&self, event: &EngineEvent) {
        self.engine.bus.publish(event.clone());
        let record = EventRecord::from_engine_event(event);
        if let Err(e) = self.engine.store.append_event(&record).await {
            tracing::warn!(error = %e, "failed to append audit event");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LanguageModel;
    use crate::store::MemoryStateStore;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use strand_types::llm::{CompletionRequest, CompletionResponse, LlmError, StopReason};
    use strand_types::workflow::{
        ReflexionPolicy, Step, StepConfig, TokenUsage,
    };

    fn step(id: &str, config: StepConfig, needs: Vec<&str>) -> Step {
        Step {
            id: id.to_string(),
            needs: needs.into_iter().map(String::from).collect(),
            when: None,
            foreach: None,
            concurrency: None,
            pool: None,
            retry: None,
            reflexion: None,
            auto_heal: None,
            quality_gate: None,
            input_schema: None,
            output_schema: None,
            timeout_ms: None,
            config,
        }
    }

    fn shell(id: &str, run: &str, needs: Vec<&str>) -> Step {
        step(
            id,
            StepConfig::Shell {
                run: run.to_string(),
                env: StdHashMap::new(),
                workdir: None,
                max_output_bytes: None,
            },
            needs,
        )
    }

    fn sleep_step(id: &str, ms: u64) -> Step {
        step(id, StepConfig::Sleep { duration_ms: ms }, vec![])
    }

    fn workflow(name: &str, steps: Vec<Step>) -> Workflow {
        Workflow {
            name: name.to_string(),
            description: None,
            version: None,
            inputs: None,
            outputs: Default::default(),
            concurrency: None,
            pools: StdHashMap::new(),
            steps,
        }
    }

    fn runner() -> WorkflowRunner<MemoryStateStore> {
        WorkflowRunner::new(EngineContext::new(
            Arc::new(MemoryStateStore::new()),
            StdHashMap::new(),
            EngineConfig::default(),
        ))
    }

    /// A model that replays a scripted sequence of responses.
    struct ScriptedModel {
        responses: Mutex<Vec<CompletionResponse>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn text(text: &str) -> CompletionResponse {
            CompletionResponse {
                text: text.to_string(),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::Request("script exhausted".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    // -------------------------------------------------------------------
    // Happy path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_two_step_shell_happy_path() {
        let runner = runner();
        let mut wf = workflow(
            "two-step",
            vec![shell("s1", "echo hi", vec![]), shell("s2", "echo done", vec!["s1"])],
        );
        wf.outputs.insert(
            "final".to_string(),
            "${{ steps.s2.output.stdout.trim() }}".to_string(),
        );

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.outputs.unwrap()["final"], "done");
        assert_eq!(result.steps["s1"].status, StepStatus::Success);
        assert_eq!(result.steps["s2"].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_yaml_authored_workflow_runs_end_to_end() {
        let yaml = r#"
name: yaml-flow
outputs:
  greeting: "${{ steps.say.output.stdout.trim() }}"
steps:
  - id: say
    type: shell
    run: "echo hello ${{ inputs.who }}"
  - id: pause
    type: sleep
    needs: [say]
    duration_ms: 5
"#;
        let wf: Workflow = serde_yaml_ng::from_str(yaml).unwrap();
        let runner = runner();
        let result = runner
            .run(
                &wf,
                RunOptions {
                    inputs: json!({"who": "world"}),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.outputs.unwrap()["greeting"], "hello world");
    }

    #[tokio::test]
    async fn test_dependency_failure_blocks_dependents() {
        let runner = runner();
        let wf = workflow(
            "failing",
            vec![shell("bad", "exit 3", vec![]), shell("after", "echo no", vec!["bad"])],
        );

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("exit"));
        // The dependent never ran.
        assert!(!result.steps.contains_key("after"));
    }

    #[tokio::test]
    async fn test_gate_skips_step_and_unblocks_dependents() {
        let runner = runner();
        let mut gated = shell("gated", "echo never", vec![]);
        gated.when = Some("${{ inputs.enabled }}".to_string());
        let wf = workflow(
            "gates",
            vec![gated, shell("after", "echo ran", vec!["gated"])],
        );

        let result = runner
            .run(
                &wf,
                RunOptions {
                    inputs: json!({"enabled": false}),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps["gated"].status, StepStatus::Skipped);
        assert_eq!(result.steps["after"].status, StepStatus::Success);
    }

    // -------------------------------------------------------------------
    // Foreach
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_foreach_aggregates_by_index() {
        let runner = runner();
        let mut fan = shell("fan", "echo item-${{ item }}-${{ index }}", vec![]);
        fan.foreach = Some("${{ ['a', 'b', 'c'] }}".to_string());
        let wf = workflow("fanout", vec![fan]);

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);

        let fan_ctx = &result.steps["fan"];
        assert_eq!(fan_ctx.status, StepStatus::Success);
        let outputs = fan_ctx.output.as_array().unwrap();
        assert_eq!(outputs.len(), 3);
        for (i, label) in ["a", "b", "c"].iter().enumerate() {
            let stdout = outputs[i]["stdout"].as_str().unwrap();
            assert_eq!(stdout.trim(), format!("item-{label}-{i}"));
        }
        assert_eq!(fan_ctx.items.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_foreach_concurrency_bound() {
        // 4 items, 50ms each, concurrency 2: wall time within [100, 180]ms.
        let runner = runner();
        let mut fan = sleep_step("fan", 50);
        fan.foreach = Some("${{ [1, 2, 3, 4] }}".to_string());
        fan.concurrency = Some(2);
        let wf = workflow("bounded", vec![fan]);

        let started = Instant::now();
        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(
            elapsed >= Duration::from_millis(100),
            "finished too fast: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(250),
            "finished too slow: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_foreach_collects_all_errors_without_fail_fast() {
        let runner = runner();
        let mut fan = shell("fan", "exit ${{ item }}", vec![]);
        fan.foreach = Some("${{ [0, 1, 0, 2] }}".to_string());
        let wf = workflow("mixed", vec![fan]);

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("2 of 4"), "got: {error}");
        // Every iteration still has an aggregated slot.
        assert_eq!(result.steps["fan"].items.as_ref().unwrap().len(), 4);
    }

    // -------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_reflexion_patches_run_but_not_identity() {
        // The model answers with a patch that also tries to rewrite id and
        // type; only `run` may take effect.
        let model = ScriptedModel::new(vec![ScriptedModel::text(
            r#"{"run": "echo fixed", "type": "script", "id": "malicious-id"}"#,
        )]);

        let store = Arc::new(MemoryStateStore::new());
        let engine = EngineContext::new(
            Arc::clone(&store),
            StdHashMap::new(),
            EngineConfig::default(),
        )
        .with_model(BoxLanguageModel::new(model));
        let runner = WorkflowRunner::new(engine);

        let mut flaky = shell("fail-step", "exit 1", vec![]);
        flaky.reflexion = Some(ReflexionPolicy {
            limit: 2,
            hint: None,
            model: None,
        });
        let wf = workflow("reflex", vec![flaky]);

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let stdout = result.steps["fail-step"].output["stdout"].as_str().unwrap();
        assert_eq!(stdout.trim(), "fixed");

        // Two executor attempts were persisted under the original identity.
        let execs = store.list_step_executions(&result.run_id).await.unwrap();
        let fail_step_rows: Vec<_> = execs
            .iter()
            .filter(|e| e.step_id == "fail-step")
            .collect();
        assert_eq!(fail_step_rows.len(), 2);
        assert!(execs.iter().all(|e| e.step_id != "malicious-id"));
    }

    #[tokio::test]
    async fn test_retry_eventually_gives_up() {
        let runner = runner();
        let mut flaky = shell("flaky", "exit 1", vec![]);
        flaky.retry = Some(strand_types::workflow::RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 5,
        });
        let wf = workflow("retry", vec![flaky]);

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        let store = &runner.engine().store;
        let execs = store.list_step_executions(&result.run_id).await.unwrap();
        assert_eq!(execs.len(), 2, "one attempt plus one retry");
        assert_eq!(execs.iter().map(|e| e.attempt).max(), Some(2));
    }

    // -------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancellation_fails_in_flight_steps() {
        let runner = runner();
        let wf = workflow("slow", vec![sleep_step("zzz", 60_000)]);

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            child.cancel();
        });

        let started = Instant::now();
        let result = runner
            .run(
                &wf,
                RunOptions {
                    inputs: json!({}),
                    resume_run_id: None,
                    cancel: Some(cancel),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(5));
        let store = &runner.engine().store;
        let execs = store.list_step_executions(&result.run_id).await.unwrap();
        assert_eq!(execs[0].status, StepStatus::Failed);
        assert_eq!(execs[0].error.as_deref(), Some("Step canceled"));
    }

    // -------------------------------------------------------------------
    // Join
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_join_waits_for_all_needs() {
        let runner = runner();
        let wf = workflow(
            "joined",
            vec![
                shell("a", "echo a", vec![]),
                shell("b", "echo b", vec![]),
                step("barrier", StepConfig::Join {}, vec!["a", "b"]),
            ],
        );

        let result = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let completed = result.steps["barrier"].output["completed"].as_array().unwrap();
        assert_eq!(completed.len(), 2);
    }

    // -------------------------------------------------------------------
    // Resume (in-memory store)
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_resume_reexecutes_only_unfinished_steps() {
        let store = Arc::new(MemoryStateStore::new());
        let engine = EngineContext::new(
            Arc::clone(&store),
            StdHashMap::new(),
            EngineConfig::default(),
        );
        let runner = WorkflowRunner::new(engine);

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("first-ran");
        let flag = dir.path().join("let-second-pass");
        let wf = workflow(
            "resumable",
            vec![
                shell("first", &format!("touch {}", marker.display()), vec![]),
                shell(
                    "second",
                    &format!("test -f {} && echo done", flag.display()),
                    vec!["first"],
                ),
            ],
        );

        // First run: `second` fails because the flag is missing.
        let initial = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(initial.status, RunStatus::Failed);
        assert!(marker.exists());

        // Fix the environment, clear the marker, and resume the failed run.
        std::fs::remove_file(&marker).unwrap();
        std::fs::write(&flag, b"ok").unwrap();

        let resumed = runner
            .run(
                &wf,
                RunOptions {
                    inputs: json!({}),
                    resume_run_id: Some(initial.run_id),
                    cancel: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(resumed.run_id, initial.run_id);
        assert_eq!(resumed.status, RunStatus::Completed);
        // The completed step did not re-execute...
        assert!(!marker.exists(), "completed step re-ran on resume");
        // ...but the failed one did, and succeeded this time.
        let stdout = resumed.steps["second"].output["stdout"].as_str().unwrap();
        assert_eq!(stdout.trim(), "done");
    }

    #[tokio::test]
    async fn test_resuming_completed_run_is_rejected() {
        let store = Arc::new(MemoryStateStore::new());
        let engine = EngineContext::new(
            Arc::clone(&store),
            StdHashMap::new(),
            EngineConfig::default(),
        );
        let runner = WorkflowRunner::new(engine);

        let wf = workflow("oneshot", vec![shell("only", "echo hi", vec![])]);
        let initial = runner.run(&wf, RunOptions::default()).await.unwrap();
        assert_eq!(initial.status, RunStatus::Completed);

        let resumed = runner
            .run(
                &wf,
                RunOptions {
                    inputs: json!({}),
                    resume_run_id: Some(initial.run_id),
                    cancel: None,
                },
            )
            .await;
        assert!(resumed.is_err(), "completed runs must not restart");
    }
}
