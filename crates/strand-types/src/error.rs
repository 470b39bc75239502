//! Engine error taxonomy.
//!
//! Executors report failure through `StepResult` values; these enums are for
//! the places where a hard error is the right shape: configuration problems,
//! store failures, and the classification carried inside step results.

use thiserror::Error;

/// Cross-cutting engine error taxonomy.
///
/// Only `Config` and `Resource` propagate out of the runner as `Err`; every
/// other kind is folded into a per-step result and handled by the recovery
/// wrappers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed workflow or engine configuration (fatal pre-run).
    #[error("configuration error: {0}")]
    Config(String),

    /// Expression evaluation failure (undefined variable, banned identifier,
    /// evaluator timeout).
    #[error("expression error{}: {message}", fmt_step(.step_id))]
    Expression {
        message: String,
        step_id: Option<String>,
    },

    /// Input or output schema violation.
    #[error("schema violation{}: {message}", fmt_step(.step_id))]
    Schema {
        message: String,
        step_id: Option<String>,
    },

    /// Denylist hit, recovery-whitelist breach, or sandbox refusal.
    #[error("security violation{}: {message}", fmt_step(.step_id))]
    Security {
        message: String,
        step_id: Option<String>,
    },

    /// A step's work failed: non-zero exit, model stream failure, tool error.
    #[error("step '{step_id}' failed (attempt {attempt}): {message}")]
    StepExecution {
        step_id: String,
        attempt: u32,
        message: String,
    },

    /// A step or external call exceeded its deadline.
    #[error("timed out after {timeout_ms}ms{}", fmt_step(.step_id))]
    Timeout {
        timeout_ms: u64,
        step_id: Option<String>,
    },

    /// Cooperative abort.
    #[error("cancelled")]
    Cancelled,

    /// Pool closed, store unavailable.
    #[error("resource error: {0}")]
    Resource(String),

    /// Multiple errors collected from a foreach fan-out. No fail-fast: every
    /// iteration ran to a terminal status before this was assembled.
    #[error("{} of {total} iterations of '{step_id}' failed", errors.len())]
    Aggregate {
        step_id: String,
        total: usize,
        errors: Vec<String>,
    },
}

fn fmt_step(step_id: &Option<String>) -> String {
    match step_id {
        Some(id) => format!(" in step '{id}'"),
        None => String::new(),
    }
}

impl EngineError {
    /// Whether this error must propagate out of the runner as `Err` instead
    /// of being folded into a step result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Resource(_))
    }
}

/// Errors from state-store operations (implemented in `strand-infra`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Resource(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::StepExecution {
            step_id: "fetch".to_string(),
            attempt: 2,
            message: "exit code 1".to_string(),
        };
        assert_eq!(err.to_string(), "step 'fetch' failed (attempt 2): exit code 1");

        let err = EngineError::Expression {
            message: "undefined variable 'foo'".to_string(),
            step_id: Some("gate".to_string()),
        };
        assert!(err.to_string().contains("in step 'gate'"));

        let err = EngineError::Timeout {
            timeout_ms: 5000,
            step_id: None,
        };
        assert_eq!(err.to_string(), "timed out after 5000ms");
    }

    #[test]
    fn test_aggregate_display() {
        let err = EngineError::Aggregate {
            step_id: "fan".to_string(),
            total: 4,
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "2 of 4 iterations of 'fan' failed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::Config("bad".to_string()).is_fatal());
        assert!(EngineError::Resource("down".to_string()).is_fatal());
        assert!(!EngineError::Cancelled.is_fatal());
        assert!(
            !EngineError::Security {
                message: "denylisted".to_string(),
                step_id: None
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_store_error_converts_to_resource() {
        let err: EngineError = StoreError::Query("locked".to_string()).into();
        assert!(matches!(err, EngineError::Resource(_)));
        assert!(err.is_fatal());
    }
}
