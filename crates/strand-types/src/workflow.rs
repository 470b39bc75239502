//! Workflow domain types for Strand.
//!
//! Defines the canonical intermediate representation for workflows: the
//! declarative DAG (`Workflow`, `Step`, tagged `StepConfig`), recovery
//! policies, and the persisted execution records (`Run`, `StepExecution`).
//! YAML files and programmatic construction both converge on these types.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key under which a foreach parent's output stores the evaluated item list.
///
/// Opaque hydration metadata: written once when the fan-out starts, read once
/// when a run is rehydrated to know how many iterations to expect.
pub const FOREACH_ITEMS_KEY: &str = "__foreach_items";

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A declarative workflow: a named DAG of steps with inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name, unique within a registry.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional semantic version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional schema describing the expected run inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    /// Workflow outputs: name -> expression evaluated against the final context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    /// Maximum steps in flight at once (None = bounded only by pools).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Named resource pools: pool name -> capacity.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pools: HashMap<String, u32>,
    /// Ordered list of step definitions forming the DAG.
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
///
/// Shared scheduling/recovery fields live on the struct; the type-specific
/// payload is the flattened, internally-tagged [`StepConfig`], so YAML reads
/// naturally:
///
/// ```yaml
/// - id: build
///   type: shell
///   run: cargo build
///   needs: [fetch]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// User-defined step id, unique within the workflow.
    pub id: String,
    /// Step ids this step depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Gate expression; when it evaluates falsy the step is skipped.
    #[serde(
        rename = "if",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub when: Option<String>,
    /// Iterable expression; when present the step fans out per item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Per-step fan-out concurrency cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Resource pool name; defaults to a per-step-type pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Backoff retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// LLM-driven self-correction policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflexion: Option<ReflexionPolicy>,
    /// Sibling-healer recovery policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_heal: Option<AutoHealPolicy>,
    /// Post-success review policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGatePolicy>,
    /// Optional schema the evaluated step inputs must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Optional schema the step output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Step-level timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Type-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub config: StepConfig,
}

impl Step {
    /// The step's kind as a stable snake_case string (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        self.config.kind()
    }

    /// Apply a recovery patch, honouring the field whitelist.
    ///
    /// Only `run` (shell), `prompt` (llm/human), and `inputs` (sub-workflow)
    /// may be rewritten. `id` and `type` are frozen: a patch that names them
    /// is silently ignored for those fields.
    pub fn apply_patch(&mut self, patch: &Value) {
        let Some(obj) = patch.as_object() else {
            return;
        };

        if let Some(run) = obj.get("run").and_then(Value::as_str) {
            if let StepConfig::Shell { run: r, .. } = &mut self.config {
                *r = run.to_string();
            }
        }
        if let Some(prompt) = obj.get("prompt").and_then(Value::as_str) {
            match &mut self.config {
                StepConfig::Llm { prompt: p, .. } => *p = prompt.to_string(),
                StepConfig::Human { prompt: p, .. } => *p = prompt.to_string(),
                _ => {}
            }
        }
        if let Some(inputs) = obj.get("inputs").and_then(Value::as_object) {
            if let StepConfig::SubWorkflow { inputs: i, .. } = &mut self.config {
                *i = inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
        }
    }
}

/// Type-specific step payload, internally tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Spawn a shell command via `bash -c`.
    Shell {
        run: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
        /// Cap on accumulated stdout/stderr bytes (default 1 MiB).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_output_bytes: Option<usize>,
    },
    /// Drive a language model with tools, MCP servers, and agent handoffs.
    Llm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mcp_servers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_handoffs: Option<u32>,
    },
    /// Cooperative pause for a fixed duration.
    Sleep { duration_ms: u64 },
    /// Human-in-the-loop prompt; suspends when no prompter is attached.
    Human {
        prompt: String,
        /// Event name the suspension is keyed on (synthesized when absent).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    /// Store to or search the shared embeddings memory.
    Memory {
        op: MemoryOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default = "default_memory_limit")]
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// Run another workflow as a child run sharing the same store.
    SubWorkflow {
        workflow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
        /// Rename child outputs: child name -> parent name.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        output_mapping: HashMap<String, String>,
    },
    /// Synchronization-only barrier aggregating its dependencies.
    Join {},
    /// Template whose strings are evaluated at run time and dispatched as a
    /// concrete step config. The step's identity is fixed.
    Dynamic { template: Value },
}

impl StepConfig {
    /// Stable snake_case kind string (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Shell { .. } => "shell",
            StepConfig::Llm { .. } => "llm",
            StepConfig::Sleep { .. } => "sleep",
            StepConfig::Human { .. } => "human",
            StepConfig::Memory { .. } => "memory",
            StepConfig::SubWorkflow { .. } => "sub_workflow",
            StepConfig::Join {} => "join",
            StepConfig::Dynamic { .. } => "dynamic",
        }
    }
}

/// Operation performed by a memory step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    Store,
    Search,
}

fn default_memory_limit() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// Recovery policies
// ---------------------------------------------------------------------------

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Ceiling on the computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let delay =
            self.initial_delay_ms as f64 * self.backoff_factor.powi(retry as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

/// LLM self-correction policy: on failure, ask a model to patch the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexionPolicy {
    /// Maximum reflexion attempts (default 2).
    #[serde(default = "default_reflexion_limit")]
    pub limit: u32,
    /// Domain hint appended to the analysis prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Model override for the reflexion call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_reflexion_limit() -> u32 {
    2
}

/// Sibling-healer policy: a dedicated llm step patches the failing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoHealPolicy {
    /// Agent driving the healer step.
    pub agent: String,
    /// Maximum heal attempts (default 1).
    #[serde(default = "default_heal_attempts")]
    pub max_attempts: u32,
}

fn default_heal_attempts() -> u32 {
    1
}

/// Post-success review policy: a reviewer model approves or requests rework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGatePolicy {
    /// Reviewer agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// What the reviewer checks for.
    pub criteria: String,
    /// Maximum reruns after rejection (default 2).
    #[serde(default = "default_gate_attempts")]
    pub max_attempts: u32,
}

fn default_gate_attempts() -> u32 {
    2
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `failed -> running` is the explicit-resume path: a failed run may be
    /// re-driven, re-executing only its non-completed steps. A completed run
    /// has no way back.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
                | (Failed, Running)
        )
    }

    /// Stable snake_case string (matches the serde form).
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }
}

/// Status of a single step execution (or one foreach iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Suspended,
}

impl StepStatus {
    /// Completed for scheduling purposes: dependents may start.
    pub fn is_completed(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }

    /// Terminal: the record is immutable (except Suspended -> Running on resume).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Suspended
        )
    }

    /// Stable snake_case string (matches the serde form).
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Suspended => "suspended",
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run id.
    pub id: Uuid,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// Run inputs as provided (post expression evaluation at the call site).
    pub inputs: Value,
    /// Evaluated workflow outputs, written at drain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// One persisted attempt at one step (or one foreach iteration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    /// Parent run id.
    pub run_id: Uuid,
    /// Step id matching `Step.id`.
    pub step_id: String,
    /// None for non-foreach steps and the fan-out parent record;
    /// 0..N-1 for fan-out children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Current status.
    pub status: StepStatus,
    /// Attempt number, 1-based; increments on recovery re-drives.
    pub attempt: u32,
    /// Idempotency key for side-effecting steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// JSON output produced by this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Token usage for model-backed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Create a fresh `pending` execution record.
    pub fn pending(run_id: Uuid, step_id: &str, iteration: Option<u32>, attempt: u32) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            run_id,
            step_id: step_id.to_string(),
            iteration,
            status: StepStatus::Pending,
            attempt,
            idempotency_key: Some(match iteration {
                Some(i) => format!("{run_id}-{step_id}-{i}-{attempt}"),
                None => format!("{run_id}-{step_id}-{attempt}"),
            }),
            output: None,
            error: None,
            usage: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Token counts accumulated across model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
