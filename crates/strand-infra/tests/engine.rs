//! End-to-end engine scenarios against a real SQLite file: happy path,
//! resume with derived-status promotion, reflexion identity freeze, and the
//! suspend/deliver-event/resume cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use strand_core::llm::{BoxLanguageModel, LanguageModel, ToolRegistry};
use strand_core::runner::{EngineConfig, EngineContext, RunOptions, WorkflowRunner};
use strand_core::store::{deliver_event, StateStore};
use strand_infra::{DatabasePool, SqliteStateStore};
use strand_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, StopReason, ToolCall, ToolDef,
};
use strand_types::workflow::{
    ReflexionPolicy, Run, RunStatus, Step, StepConfig, StepExecution, StepStatus, TokenUsage,
    Workflow, FOREACH_ITEMS_KEY,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn sqlite_store() -> Arc<SqliteStateStore> {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("e.db").display());
    std::mem::forget(dir);
    Arc::new(SqliteStateStore::new(DatabasePool::new(&url).await.unwrap()))
}

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
            env: HashMap::new(),
            workdir: None,
            max_output_bytes: None,
        },
        needs,
    )
}

fn workflow(name: &str, steps: Vec<Step>) -> Workflow {
    Workflow {
        name: name.to_string(),
        description: None,
        version: None,
        inputs: None,
        outputs: Default::default(),
        concurrency: None,
        pools: HashMap::new(),
        steps,
    }
}

/// Replays a scripted sequence of completion responses.
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

    fn tool_call(name: &str, args: Value) -> CompletionResponse {
        CompletionResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                args,
            }],
            stop_reason: StopReason::ToolUse,
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

// ---------------------------------------------------------------------------
// Scenario: two-step happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_step_happy_path_persists_outputs() {
    let store = sqlite_store().await;
    let runner = WorkflowRunner::new(EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
        EngineConfig::default(),
    ));

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
    assert_eq!(result.outputs.as_ref().unwrap()["final"], "done");

    // The run row carries the evaluated outputs and terminal status.
    let run = store.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outputs.unwrap()["final"], "done");

    // Both steps reached success with ordered lifecycle timestamps.
    for id in ["s1", "s2"] {
        let exec = store.get_main_step(&result.run_id, id).await.unwrap().unwrap();
        assert_eq!(exec.status, StepStatus::Success);
        assert!(exec.started_at.unwrap() <= exec.ended_at.unwrap());
    }
}

// ---------------------------------------------------------------------------
// Scenario: resume with completed foreach but RUNNING parent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_promotes_foreach_parent_without_writing_it() {
    let store = sqlite_store().await;

    // Pre-seed the database as if the process died after the last iteration
    // commit but before the parent commit.
    let run = Run {
        id: Uuid::now_v7(),
        workflow_name: "resume-fan".to_string(),
        status: RunStatus::Pending,
        inputs: json!({}),
        outputs: None,
        error: None,
        started_at: chrono::Utc::now(),
        ended_at: None,
    };
    store.create_run(&run).await.unwrap();
    store
        .update_run_status(&run.id, RunStatus::Running, None)
        .await
        .unwrap();

    let parent = StepExecution::pending(run.id, "foreach_step", None, 1);
    store.create_step(&parent).await.unwrap();
    store.start_step(&parent.id).await.unwrap();
    store
        .complete_step(
            &parent.id,
            StepStatus::Running,
            Some(&json!({ FOREACH_ITEMS_KEY: [1, 2, 3] })),
            None,
            None,
        )
        .await
        .unwrap();

    for i in 0..3u32 {
        let iteration = StepExecution::pending(run.id, "foreach_step", Some(i), 1);
        store.create_step(&iteration).await.unwrap();
        store.start_step(&iteration.id).await.unwrap();
        store
            .complete_step(
                &iteration.id,
                StepStatus::Success,
                Some(&json!(i + 1)),
                None,
                None,
            )
            .await
            .unwrap();
    }
    // `next_step` has no rows at all.

    let mut fan = shell("foreach_step", "echo ${{ item }}", vec![]);
    fan.foreach = Some("${{ [1, 2, 3] }}".to_string());
    let mut wf = workflow(
        "resume-fan",
        vec![fan, shell("next_step", "echo done", vec!["foreach_step"])],
    );
    wf.outputs.insert(
        "final".to_string(),
        "${{ steps.next_step.output.stdout.trim() }}".to_string(),
    );

    let runner = WorkflowRunner::new(EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
        EngineConfig::default(),
    ));
    let result = runner
        .run(
            &wf,
            RunOptions {
                inputs: json!({}),
                resume_run_id: Some(run.id),
                cancel: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outputs.unwrap()["final"], "done");

    // The foreach parent context was promoted in memory...
    assert_eq!(result.steps["foreach_step"].status, StepStatus::Success);
    assert_eq!(result.steps["foreach_step"].output, json!([1, 2, 3]));

    // ...but its database row was never touched: promotion is derivation.
    let parent_row = store
        .get_main_step(&run.id, "foreach_step")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent_row.status, StepStatus::Running);

    // next_step executed exactly once, and no new iteration rows appeared.
    let execs = store.list_step_executions(&run.id).await.unwrap();
    let next_rows = execs.iter().filter(|e| e.step_id == "next_step").count();
    assert_eq!(next_rows, 1);
    let fan_rows = execs.iter().filter(|e| e.step_id == "foreach_step").count();
    assert_eq!(fan_rows, 4, "1 parent + 3 iterations, nothing new");
}

// ---------------------------------------------------------------------------
// Scenario: reflexion refuses identity/type rewrite
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reflexion_patches_run_and_freezes_identity() {
    let store = sqlite_store().await;
    let model = ScriptedModel::new(vec![ScriptedModel::text(
        r#"{"run": "echo fixed", "type": "script", "id": "malicious-id"}"#,
    )]);
    let engine = EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
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

    // Exactly two executor calls, both under the original id; the patched
    // type never took effect.
    let execs = store.list_step_executions(&result.run_id).await.unwrap();
    assert_eq!(execs.len(), 2);
    assert!(execs.iter().all(|e| e.step_id == "fail-step"));
    assert_eq!(execs.iter().filter(|e| e.status == StepStatus::Failed).count(), 1);
    assert_eq!(execs.iter().filter(|e| e.status == StepStatus::Success).count(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: suspend on human input, deliver the event, resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn human_step_suspends_and_resumes_on_event() {
    let store = sqlite_store().await;
    let runner = WorkflowRunner::new(EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
        EngineConfig::default(),
    ));

    let mut wf = workflow(
        "approval-flow",
        vec![
            step(
                "approve",
                StepConfig::Human {
                    prompt: "Ship it?".to_string(),
                    event: Some("ship.decision".to_string()),
                },
                vec![],
            ),
            shell("announce", "echo shipped", vec!["approve"]),
        ],
    );
    wf.outputs.insert(
        "answer".to_string(),
        "${{ steps.approve.output.answer }}".to_string(),
    );

    // Headless: the human step parks and the run pauses.
    let first = runner.run(&wf, RunOptions::default()).await.unwrap();
    assert_eq!(first.status, RunStatus::Paused);

    let suspended = store
        .get_suspended_steps_for_event("ship.decision")
        .await
        .unwrap();
    assert_eq!(suspended, vec![(first.run_id, "approve".to_string())]);

    // Deliver the decision, then resume the run.
    let unblocked = deliver_event(store.as_ref(), "ship.decision", json!({"__answer": "yes"}))
        .await
        .unwrap();
    assert_eq!(unblocked.len(), 1);

    let resumed = runner
        .run(
            &wf,
            RunOptions {
                inputs: json!({}),
                resume_run_id: Some(first.run_id),
                cancel: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.outputs.unwrap()["answer"], "yes");
    assert_eq!(resumed.steps["announce"].status, StepStatus::Success);
}

// ---------------------------------------------------------------------------
// Scenario: llm tool loop with output schema
// ---------------------------------------------------------------------------

#[tokio::test]
async fn llm_step_runs_tools_and_enforces_output_schema() {
    let store = sqlite_store().await;

    let model = ScriptedModel::new(vec![
        ScriptedModel::tool_call("lookup", json!({"key": "ultimate"})),
        ScriptedModel::text(r#"{"answer": 42}"#),
    ]);

    let mut tools = ToolRegistry::new();
    tools.register(
        ToolDef {
            name: "lookup".to_string(),
            description: Some("Look a value up".to_string()),
            input_schema: json!({"type": "object"}),
        },
        Arc::new(|args| {
            Box::pin(async move {
                assert_eq!(args["key"], "ultimate");
                Ok(json!({"value": 42}))
            })
        }),
    );

    let engine = EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
        EngineConfig::default(),
    )
    .with_model(BoxLanguageModel::new(model))
    .with_tools(tools);
    let runner = WorkflowRunner::new(engine);

    let mut ask = step(
        "compute",
        StepConfig::Llm {
            agent: None,
            prompt: "What is the answer?".to_string(),
            system: None,
            model: None,
            tools: vec!["lookup".to_string()],
            mcp_servers: vec![],
            max_iterations: None,
            max_handoffs: None,
        },
        vec![],
    );
    ask.output_schema = Some(json!({
        "type": "object",
        "required": ["answer"],
        "properties": { "answer": { "type": "integer" } }
    }));
    let wf = workflow("llm-tools", vec![ask]);

    let result = runner.run(&wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.steps["compute"].output["answer"], 42);

    // Usage accumulated across both turns.
    let exec = store
        .get_main_step(&result.run_id, "compute")
        .await
        .unwrap()
        .unwrap();
    let usage = exec.usage.unwrap();
    assert_eq!(usage.input_tokens, 20);
    assert_eq!(usage.output_tokens, 10);

    // The tool call landed in the audit trail.
    let event = store.get_external_event("tool_called").await.unwrap();
    assert!(event.is_some());
}

// ---------------------------------------------------------------------------
// Scenario: secrets never reach the database
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shell_output_is_redacted_before_persistence() {
    let store = sqlite_store().await;
    let secrets: HashMap<String, String> =
        [("api_key".to_string(), "sk-super-secret-123".to_string())].into();

    let engine = EngineContext::new(Arc::clone(&store), secrets, EngineConfig::default());
    let runner = WorkflowRunner::new(engine);

    let wf = workflow(
        "leaky",
        vec![shell("leak", "echo using sk-super-secret-123 here", vec![])],
    );
    let result = runner.run(&wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let exec = store.get_main_step(&result.run_id, "leak").await.unwrap().unwrap();
    let stdout = exec.output.unwrap()["stdout"].as_str().unwrap().to_string();
    assert!(!stdout.contains("sk-super-secret-123"), "leaked: {stdout}");
    assert!(stdout.contains("***REDACTED***"));
}

// ---------------------------------------------------------------------------
// Scenario: denylist blocks the command before it spawns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn denylisted_command_fails_with_security_error() {
    let store = sqlite_store().await;
    let config = EngineConfig {
        denylist: vec!["rm".to_string()],
        ..Default::default()
    };
    let runner = WorkflowRunner::new(EngineContext::new(
        Arc::clone(&store),
        HashMap::new(),
        config,
    ));

    let wf = workflow("dangerous", vec![shell("wipe", "rm -rf /tmp/nothing", vec![])]);
    let result = runner.run(&wf, RunOptions::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("security violation"), "got: {error}");
    assert!(error.contains("'rm'"));
}
