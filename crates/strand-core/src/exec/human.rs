//! Human executor: prompt through the attached [`Prompter`], or park the
//! step as `suspended` keyed on an event name.
//!
//! Resume: when the runner re-enters a suspended human step it passes the
//! delivered event payload; the answer is taken from its `__answer` field
//! (or the whole payload when that field is absent).

use std::sync::Arc;

use serde_json::{json, Value};
use strand_types::error::EngineError;
use uuid::Uuid;

use super::StepResult;
use crate::context::RunContext;
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Event name a human suspension parks on when none is configured.
pub fn default_event_name(run_id: &Uuid, step_id: &str) -> String {
    format!("human:{run_id}:{step_id}")
}

pub async fn run_human<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    run_ctx: &RunContext,
    step_id: &str,
    prompt_template: &str,
    event: Option<&str>,
    expr_ctx: &Value,
    resume: Option<&Value>,
) -> StepResult {
    let question = match engine.evaluator.evaluate_string(prompt_template, expr_ctx) {
        Ok(question) => question,
        Err(e) => {
            return StepResult::failed(
                EngineError::Expression {
                    message: e.to_string(),
                    step_id: Some(step_id.to_string()),
                }
                .to_string(),
            )
        }
    };

    // Resuming with a delivered event: the answer rides in the payload.
    if let Some(payload) = resume {
        let answer = payload
            .get("__answer")
            .cloned()
            .unwrap_or_else(|| payload.clone());
        if let Err(e) = engine.store.remove_suspension(&run_ctx.run_id, step_id).await {
            tracing::warn!(step_id, error = %e, "failed to clear suspension");
        }
        return StepResult::success(json!({ "question": question, "answer": answer }));
    }

    // Interactive path.
    if let Some(prompter) = &engine.prompter {
        return match prompter.ask(&question).await {
            Ok(answer) => {
                StepResult::success(json!({ "question": question, "answer": answer }))
            }
            Err(e) => StepResult::failed(format!("prompt failed: {e}")),
        };
    }

    // Headless: park on the event.
    let event_name = event
        .map(String::from)
        .unwrap_or_else(|| default_event_name(&run_ctx.run_id, step_id));
    if let Err(e) = engine
        .store
        .create_suspension(&run_ctx.run_id, step_id, &event_name)
        .await
    {
        return StepResult::failed(format!("failed to record suspension: {e}"));
    }

    StepResult::suspended(json!({ "question": question, "event": event_name }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_event_name_is_scoped() {
        let run_id = Uuid::now_v7();
        let name = default_event_name(&run_id, "approve");
        assert!(name.starts_with("human:"));
        assert!(name.ends_with(":approve"));
        assert!(name.contains(&run_id.to_string()));
    }
}
