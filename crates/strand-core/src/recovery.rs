//! Recovery wrappers: retry, reflexion, auto-heal, and the quality gate.
//!
//! Sequencing on failure is retry -> reflexion -> auto-heal; the quality
//! gate fires on success. Each policy is opt-in and each re-drive creates a
//! fresh execution record with an incremented attempt.
//!
//! Identity is frozen: no recovery mechanism may alter a step's `id` or
//! `type`. Patches are applied through `Step::apply_patch`, which only
//! honours the `run` / `prompt` / `inputs` whitelist and silently drops
//! everything else.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strand_types::error::EngineError;
use strand_types::event::EngineEvent;
use strand_types::workflow::{
    AutoHealPolicy, QualityGatePolicy, ReflexionPolicy, Step, StepConfig, StepStatus, Workflow,
};
use strand_types::llm::{ChatMessage, CompletionRequest};
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::exec::{self, StepResult, CANCELED};
use crate::llm::extract_json;
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Run a step through its full recovery chain.
///
/// Returns `Err` only for store failures; every execution outcome (including
/// exhausted recovery) comes back as a [`StepResult`].
pub async fn run_with_recovery<S: StateStore + 'static>(
    engine: &Arc<EngineContext<S>>,
    workflow: &Workflow,
    run_ctx: &RunContext,
    step: &Step,
    cancel: &CancellationToken,
    resume: Option<&Value>,
) -> Result<StepResult, EngineError> {
    let mut current = step.clone();
    let mut attempt = 1u32;
    let mut retries_used = 0u32;
    let mut reflexions_used = 0u32;
    let mut heals_used = 0u32;
    let mut gate_reruns = 0u32;

    loop {
        let resume = if attempt == 1 { resume } else { None };
        let result =
            exec::run_attempt(engine, workflow, run_ctx, &current, cancel, attempt, resume)
                .await?;

        match result.status {
            StepStatus::Skipped | StepStatus::Suspended => return Ok(result),

            StepStatus::Success => {
                let Some(policy) = &step.quality_gate else {
                    return Ok(result);
                };
                if engine.model.is_none() {
                    return Ok(result);
                }

                let review = review_output(engine, policy, &current, &result).await;
                if review.approved {
                    return Ok(result);
                }

                if gate_reruns < policy.max_attempts {
                    gate_reruns += 1;
                    attempt += 1;
                    tracing::info!(
                        step_id = step.id.as_str(),
                        rerun = gate_reruns,
                        "quality gate rejected output, rerunning"
                    );
                    append_gate_feedback(&mut current, &review);
                    continue;
                }

                // Exhausted: accept the last output, record the unmet gate.
                let event = EngineEvent::QualityGateUnmet {
                    run_id: run_ctx.run_id,
                    step_id: step.id.clone(),
                    issues: review.issues.clone(),
                };
                engine.bus.publish(event.clone());
                exec::audit(engine, &event).await;
                return Ok(result);
            }

            StepStatus::Failed => {
                let error = result.error.clone().unwrap_or_default();
                if cancel.is_cancelled() || error == CANCELED {
                    return Ok(result);
                }

                // 1. Retry: same definition after backoff.
                if let Some(policy) = &step.retry {
                    if retries_used + 1 < policy.max_attempts {
                        let delay = policy.delay_ms(retries_used);
                        tracing::debug!(
                            step_id = step.id.as_str(),
                            attempt,
                            delay_ms = delay,
                            "retrying after backoff"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                            _ = cancel.cancelled() => return Ok(result),
                        }
                        retries_used += 1;
                        attempt += 1;
                        continue;
                    }
                }

                // 2. Reflexion: ask a model to patch the step.
                if let Some(policy) = &step.reflexion {
                    if reflexions_used < policy.limit && engine.model.is_some() {
                        if let Some(patch) =
                            reflect(engine, &current, &error, policy, cancel).await
                        {
                            current.apply_patch(&patch);
                        }
                        reflexions_used += 1;
                        attempt += 1;
                        continue;
                    }
                }

                // 3. Auto-heal: a sibling llm step produces the patch.
                if let Some(policy) = &step.auto_heal {
                    if heals_used < policy.max_attempts && engine.model.is_some() {
                        let healer = build_healer(&current, &error, policy);
                        let healed = exec::run_attempt(
                            engine,
                            workflow,
                            run_ctx,
                            &healer,
                            cancel,
                            heals_used + 1,
                            None,
                        )
                        .await?;
                        if healed.status == StepStatus::Success {
                            if let Some(patch) = patch_from_output(&healed.output) {
                                current.apply_patch(&patch);
                            }
                        }
                        heals_used += 1;
                        attempt += 1;
                        continue;
                    }
                }

                return Ok(result);
            }

            StepStatus::Pending | StepStatus::Running => return Ok(result),
        }
    }
}

// ---------------------------------------------------------------------------
// Reflexion
// ---------------------------------------------------------------------------

/// Ask the engine's model how to fix a failing step. Returns the patch
/// object, or `None` when the model's answer is unusable; the attempt is
/// consumed either way so the policy chain still converges.
async fn reflect<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    step: &Step,
    error: &str,
    policy: &ReflexionPolicy,
    cancel: &CancellationToken,
) -> Option<Value> {
    let model = engine.model.as_ref()?;
    let prompt = build_reflexion_prompt(step, error, policy.hint.as_deref());

    let request = CompletionRequest {
        model: policy.model.clone(),
        system: None,
        messages: vec![ChatMessage::user(prompt)],
        tools: vec![],
        max_tokens: None,
        temperature: None,
    };

    let response = tokio::select! {
        response = model.complete(&request) => response,
        _ = cancel.cancelled() => return None,
    };

    match response {
        Ok(response) => {
            let patch = extract_json(&response.text);
            if patch.is_none() {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    "reflexion response contained no patch object"
                );
            }
            patch.filter(Value::is_object)
        }
        Err(e) => {
            tracing::warn!(step_id = step.id.as_str(), error = %e, "reflexion call failed");
            None
        }
    }
}

fn build_reflexion_prompt(step: &Step, error: &str, hint: Option<&str>) -> String {
    let definition = serde_json::to_string_pretty(step).unwrap_or_default();
    let hint_section = hint
        .map(|h| format!("\nDomain hint: {h}\n"))
        .unwrap_or_default();

    format!(
        "## Step Self-Correction\n\
         \n\
         A workflow step failed and needs a corrected definition.\n\
         \n\
         **Step definition:**\n\
         ```json\n\
         {definition}\n\
         ```\n\
         **Error:**\n\
         ```\n\
         {error}\n\
         ```\n\
         {hint_section}\n\
         Analyze the failure and respond with a JSON object containing ONLY\n\
         the fields to change. Allowed fields: \"run\", \"prompt\", \"inputs\".\n\
         The step's id and type cannot be changed."
    )
}

// ---------------------------------------------------------------------------
// Auto-heal
// ---------------------------------------------------------------------------

/// Build the sibling healer step: `<id>-healer`, type llm, driven by the
/// policy's agent, no recovery policies of its own.
fn build_healer(step: &Step, error: &str, policy: &AutoHealPolicy) -> Step {
    let definition = serde_json::to_string_pretty(step).unwrap_or_default();
    Step {
        id: format!("{}-healer", step.id),
        needs: vec![],
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
        timeout_ms: step.timeout_ms,
        config: StepConfig::Llm {
            agent: Some(policy.agent.clone()),
            prompt: format!(
                "The following workflow step failed:\n```json\n{definition}\n```\n\
                 Error:\n```\n{error}\n```\n\
                 Respond with a JSON object containing ONLY the fields to change.\n\
                 Allowed fields: \"run\", \"prompt\", \"inputs\"."
            ),
            system: None,
            model: None,
            tools: vec![],
            mcp_servers: vec![],
            max_iterations: Some(1),
            max_handoffs: Some(0),
        },
    }
}

fn patch_from_output(output: &Value) -> Option<Value> {
    match output {
        Value::Object(_) => Some(output.clone()),
        Value::String(text) => extract_json(text).filter(Value::is_object),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

struct GateReview {
    approved: bool,
    issues: Vec<String>,
    suggestions: Vec<String>,
}

/// Ask the reviewer model whether a successful output meets the gate's
/// criteria. An unusable review counts as approval: the gate must never turn
/// a good output into a livelock.
async fn review_output<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    policy: &QualityGatePolicy,
    step: &Step,
    result: &StepResult,
) -> GateReview {
    let approved = GateReview {
        approved: true,
        issues: vec![],
        suggestions: vec![],
    };
    let Some(model) = engine.model.as_ref() else {
        return approved;
    };

    let system = policy
        .agent
        .as_ref()
        .and_then(|name| engine.agents.get(name))
        .map(|profile| profile.system.clone());

    let output = serde_json::to_string_pretty(&result.output).unwrap_or_default();
    let prompt = format!(
        "Review the output of workflow step '{}' against these criteria:\n\
         {}\n\
         \n\
         **Output:**\n\
         ```json\n\
         {output}\n\
         ```\n\
         Respond with a JSON object: {{\"approved\": bool, \"issues\": [..], \"suggestions\": [..]}}.",
        step.id, policy.criteria
    );

    let request = CompletionRequest {
        model: None,
        system,
        messages: vec![ChatMessage::user(prompt)],
        tools: vec![],
        max_tokens: None,
        temperature: None,
    };

    match model.complete(&request).await {
        Ok(response) => match extract_json(&response.text) {
            Some(review) => GateReview {
                approved: review
                    .get("approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                issues: string_list(review.get("issues")),
                suggestions: string_list(review.get("suggestions")),
            },
            None => {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    "quality gate reviewer returned no JSON, accepting output"
                );
                approved
            }
        },
        Err(e) => {
            tracing::warn!(step_id = step.id.as_str(), error = %e, "quality gate call failed");
            approved
        }
    }
}

/// Feed the reviewer's feedback into the next run. Only llm prompts have a
/// place for it; other step kinds simply rerun.
fn append_gate_feedback(step: &mut Step, review: &GateReview) {
    if let StepConfig::Llm { prompt, .. } = &mut step.config {
        let mut feedback = String::from("\n\nA reviewer rejected the previous answer.");
        if !review.issues.is_empty() {
            feedback.push_str("\nIssues:");
            for issue in &review.issues {
                feedback.push_str(&format!("\n- {issue}"));
            }
        }
        if !review.suggestions.is_empty() {
            feedback.push_str("\nSuggestions:");
            for suggestion in &review.suggestions {
                feedback.push_str(&format!("\n- {suggestion}"));
            }
        }
        prompt.push_str(&feedback);
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
