//! Per-run execution context: step outputs, inputs, secrets, env, and the
//! JSON object that expressions evaluate against.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use strand_types::workflow::StepStatus;
use uuid::Uuid;

/// Maximum size of a single step output kept in the context (1 MiB).
/// Larger outputs are replaced with a truncation stub; the store keeps the
/// capped executor output, the context guards the in-memory working set.
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What downstream expressions see of a finished step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    /// The step's output value. For a foreach parent, the index-ordered
    /// array of iteration outputs.
    pub output: Value,
    /// Named outputs: the output itself when it is an object, or the
    /// element-wise merge of iteration outputs for a foreach parent.
    pub outputs: Value,
    pub status: StepStatus,
    pub error: Option<String>,
    /// Per-iteration contexts for a foreach parent.
    pub items: Option<Vec<StepContext>>,
}

impl StepContext {
    /// A plain successful step.
    pub fn success(output: Value) -> Self {
        let outputs = if output.is_object() {
            output.clone()
        } else {
            json!({})
        };
        Self {
            output,
            outputs,
            status: StepStatus::Success,
            error: None,
            items: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            output: Value::Null,
            outputs: json!({}),
            status: StepStatus::Skipped,
            error: None,
            items: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            outputs: json!({}),
            status: StepStatus::Failed,
            error: Some(error.into()),
            items: None,
        }
    }

    /// Shape exposed to expressions under `steps.<id>`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("output".to_string(), self.output.clone());
        map.insert("outputs".to_string(), self.outputs.clone());
        map.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        map.insert(
            "error".to_string(),
            self.error
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        if let Some(items) = &self.items {
            map.insert(
                "items".to_string(),
                Value::Array(items.iter().map(|i| i.to_value()).collect()),
            );
        }
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Mutable state that flows through one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub inputs: Value,
    pub secrets: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub steps: HashMap<String, StepContext>,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: Value,
        secrets: HashMap<String, String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            inputs,
            secrets,
            env,
            steps: HashMap::new(),
        }
    }

    /// Record a finished step, capping oversized outputs.
    pub fn set_step(&mut self, step_id: &str, mut ctx: StepContext) {
        let size = serde_json::to_string(&ctx.output)
            .map(|s| s.len())
            .unwrap_or(0);
        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds context size limit, truncating"
            );
            ctx.output = json!({
                "_truncated": true,
                "_original_size": size,
            });
            ctx.outputs = json!({});
        }
        self.steps.insert(step_id.to_string(), ctx);
    }

    pub fn step(&self, step_id: &str) -> Option<&StepContext> {
        self.steps.get(step_id)
    }

    /// Build the JSON object expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "inputs": …, "secrets": …, "env": …,
    ///   "steps": { "<id>": { "output": …, "outputs": …, "status": …, "error": … } },
    ///   "item": …, "index": …, "memory": {},
    ///   "workflow": { "name": "…", "run_id": "…" }
    /// }
    /// ```
    pub fn expression_context(&self, item: Option<&Value>, index: Option<usize>) -> Value {
        let mut steps = Map::new();
        for (id, ctx) in &self.steps {
            steps.insert(id.clone(), ctx.to_value());
        }

        json!({
            "inputs": self.inputs,
            "secrets": self.secrets,
            "env": self.env,
            "steps": steps,
            "item": item.cloned().unwrap_or(Value::Null),
            "index": index.map(|i| json!(i)).unwrap_or(Value::Null),
            "memory": {},
            "workflow": {
                "name": self.workflow_name,
                "run_id": self.run_id.to_string(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
