//! Engine events: the in-process broadcast shapes and the persisted audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events published on the engine's broadcast bus while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
    },
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
    },
    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        kind: String,
        iteration: Option<u32>,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        iteration: Option<u32>,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        iteration: Option<u32>,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
    },
    StepSuspended {
        run_id: Uuid,
        step_id: String,
        event_name: String,
    },
    ToolCalled {
        run_id: Uuid,
        step_id: String,
        tool: String,
    },
    SubWorkflowStarted {
        run_id: Uuid,
        step_id: String,
        child_run_id: Uuid,
    },
    AgentHandoff {
        run_id: Uuid,
        step_id: String,
        from_agent: Option<String>,
        to_agent: String,
    },
    QualityGateUnmet {
        run_id: Uuid,
        step_id: String,
        issues: Vec<String>,
    },
    BreakerStateChanged {
        name: String,
        state: String,
    },
}

impl EngineEvent {
    /// Stable snake_case kind string for the persisted audit row.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::RunStarted { .. } => "run_started",
            EngineEvent::RunCompleted { .. } => "run_completed",
            EngineEvent::RunFailed { .. } => "run_failed",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::StepSkipped { .. } => "step_skipped",
            EngineEvent::StepSuspended { .. } => "step_suspended",
            EngineEvent::ToolCalled { .. } => "tool_called",
            EngineEvent::SubWorkflowStarted { .. } => "sub_workflow_started",
            EngineEvent::AgentHandoff { .. } => "agent_handoff",
            EngineEvent::QualityGateUnmet { .. } => "quality_gate_unmet",
            EngineEvent::BreakerStateChanged { .. } => "breaker_state_changed",
        }
    }
}

/// A persisted audit-trail row. Append-only.
///
/// Also doubles as the external-event mailbox: `store_event(name, data)`
/// appends a row with `kind = name` and no run/step attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub kind: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl EventRecord {
    /// Build an audit row from a broadcast event.
    pub fn from_engine_event(event: &EngineEvent) -> Self {
        let (run_id, step_id) = match event {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. } => (Some(*run_id), None),
            EngineEvent::StepStarted {
                run_id, step_id, ..
            }
            | EngineEvent::StepCompleted {
                run_id, step_id, ..
            }
            | EngineEvent::StepFailed {
                run_id, step_id, ..
            }
            | EngineEvent::StepSkipped { run_id, step_id }
            | EngineEvent::StepSuspended {
                run_id, step_id, ..
            }
            | EngineEvent::ToolCalled {
                run_id, step_id, ..
            }
            | EngineEvent::SubWorkflowStarted {
                run_id, step_id, ..
            }
            | EngineEvent::AgentHandoff {
                run_id, step_id, ..
            }
            | EngineEvent::QualityGateUnmet {
                run_id, step_id, ..
            } => (Some(*run_id), Some(step_id.clone())),
            EngineEvent::BreakerStateChanged { .. } => (None, None),
        };

        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id,
            kind: event.kind().to_string(),
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            ts: Utc::now(),
        }
    }

    /// Build an external-event row (`store_event(name, data)`).
    pub fn external(name: &str, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id: None,
            step_id: None,
            kind: name.to_string(),
            payload: data,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_matches_serde_tag() {
        let event = EngineEvent::StepFailed {
            run_id: Uuid::now_v7(),
            step_id: "fetch".to_string(),
            iteration: Some(2),
            error: "boom".to_string(),
            will_retry: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
    }

    #[test]
    fn test_audit_row_attribution() {
        let run_id = Uuid::now_v7();
        let event = EngineEvent::StepStarted {
            run_id,
            step_id: "fetch".to_string(),
            kind: "shell".to_string(),
            iteration: None,
            attempt: 1,
        };
        let row = EventRecord::from_engine_event(&event);
        assert_eq!(row.run_id, Some(run_id));
        assert_eq!(row.step_id.as_deref(), Some("fetch"));
        assert_eq!(row.kind, "step_started");
    }

    #[test]
    fn test_external_event_row() {
        let row = EventRecord::external("deploy.approved", json!({"by": "ops"}));
        assert_eq!(row.kind, "deploy.approved");
        assert!(row.run_id.is_none());
        assert_eq!(row.payload["by"], "ops");
    }
}
