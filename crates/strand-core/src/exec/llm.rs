//! LLM executor: drives a model handle through a tool-use loop with agent
//! handoffs.
//!
//! The message list survives handoffs: `transfer_to_agent` swaps the system
//! prompt and tool set but keeps the conversation. `ask` reaches the
//! attached prompter, or suspends the step with `{question, messages}` so a
//! later event can resume it by injecting the answer as a tool result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use strand_types::error::EngineError;
use strand_types::event::EngineEvent;
use strand_types::llm::{ChatMessage, CompletionRequest, ToolCall, ToolDef};
use strand_types::workflow::{Step, StepConfig, TokenUsage};
use tokio_util::sync::CancellationToken;

use super::{audit, StepResult, CANCELED};
use crate::context::RunContext;
use crate::llm::extract_json;
use crate::mcp::McpClient;
use crate::runner::EngineContext;
use crate::store::StateStore;

/// Default cap on model turns within one step.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default cap on agent handoffs within one step.
pub const DEFAULT_MAX_HANDOFFS: u32 = 10;

/// Event name an `ask` suspension parks on.
fn ask_event_name(run_ctx: &RunContext, step_id: &str) -> String {
    format!("ask:{}:{step_id}", run_ctx.run_id)
}

pub async fn run_llm<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    run_ctx: &RunContext,
    step: &Step,
    expr_ctx: &Value,
    cancel: &CancellationToken,
    resume: Option<&Value>,
) -> StepResult {
    let StepConfig::Llm {
        agent,
        prompt,
        system,
        model,
        tools,
        mcp_servers,
        max_iterations,
        max_handoffs,
    } = &step.config
    else {
        return StepResult::failed("not an llm step");
    };

    let Some(model_handle) = &engine.model else {
        return StepResult::failed("no language model attached to the engine".to_string());
    };

    let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
    let max_handoffs = max_handoffs.unwrap_or(DEFAULT_MAX_HANDOFFS);

    // Active agent state: system prompt, model override, tool names.
    let mut current_agent: Option<String> = agent.clone();
    let mut current_system = system.clone();
    let mut current_model = model.clone();
    let mut agent_tools: Vec<String> = Vec::new();
    if let Some(name) = agent {
        match engine.agents.get(name) {
            Some(profile) => {
                current_system = Some(profile.system.clone());
                current_model = profile.model.clone().or(current_model);
                agent_tools = profile.tools.clone();
            }
            None => return StepResult::failed(format!("unknown agent '{name}'")),
        }
    }

    // MCP tool discovery, once per step.
    let mut mcp_tools: HashMap<String, (Arc<dyn McpClient>, ToolDef)> = HashMap::new();
    for server in mcp_servers {
        let Some(client) = engine.mcp.get(server) else {
            return StepResult::failed(format!("unknown MCP server '{server}'"));
        };
        if let Err(e) = client.initialize().await {
            return StepResult::failed(format!("MCP server '{server}' failed to start: {e}"));
        }
        match client.list_tools().await {
            Ok(defs) => {
                for def in defs {
                    mcp_tools
                        .entry(def.name.clone())
                        .or_insert_with(|| (Arc::clone(client), def));
                }
            }
            Err(e) => {
                return StepResult::failed(format!("MCP server '{server}' listTools: {e}"))
            }
        }
    }

    let mut tool_defs = build_tool_defs(engine, &agent_tools, tools, &mcp_tools);

    // Conversation: resumed from a suspension, or fresh from the prompt.
    let mut messages: Vec<ChatMessage> = match resume {
        Some(payload) => {
            let mut messages: Vec<ChatMessage> = payload
                .get("messages")
                .cloned()
                .and_then(|m| serde_json::from_value(m).ok())
                .unwrap_or_default();
            if messages.is_empty() {
                return StepResult::failed("resume payload has no messages".to_string());
            }
            let call_id = payload
                .get("call_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let answer = payload
                .get("__answer")
                .cloned()
                .unwrap_or(Value::Null);
            messages.push(ChatMessage::tool_result(call_id, value_to_text(&answer)));
            if let Err(e) = engine
                .store
                .remove_suspension(&run_ctx.run_id, &step.id)
                .await
            {
                tracing::warn!(step_id = step.id.as_str(), error = %e, "failed to clear suspension");
            }
            messages
        }
        None => {
            let prompt = match engine.evaluator.evaluate_string(prompt, expr_ctx) {
                Ok(prompt) => prompt,
                Err(e) => {
                    return StepResult::failed(
                        EngineError::Expression {
                            message: e.to_string(),
                            step_id: Some(step.id.clone()),
                        }
                        .to_string(),
                    )
                }
            };
            vec![ChatMessage::user(prompt)]
        }
    };

    let mut usage = TokenUsage::default();
    let mut handoffs = 0u32;

    for _turn in 0..max_iterations {
        if cancel.is_cancelled() {
            return StepResult::failed(CANCELED).with_usage(usage);
        }

        let request = CompletionRequest {
            model: current_model.clone(),
            system: current_system.clone(),
            messages: messages.clone(),
            tools: tool_defs.clone(),
            max_tokens: None,
            temperature: None,
        };

        // Model calls contend on the shared limiter and breaker: a wedged or
        // rate-limited adapter fails fast instead of stacking requests.
        if let Some(limiter) = &engine.model_limiter {
            let acquired = limiter
                .acquire(crate::resilience::rate_limiter::AcquireOptions {
                    timeout: None,
                    signal: Some(cancel.clone()),
                })
                .await;
            if let Err(e) = acquired {
                return StepResult::failed(format!("model rate limit: {e}")).with_usage(usage);
            }
        }
        if !engine.model_breaker.is_allowed() {
            return StepResult::failed("model circuit is open".to_string()).with_usage(usage);
        }

        let response = tokio::select! {
            response = model_handle.complete(&request) => response,
            // Dropping the in-flight future aborts the underlying transport.
            _ = cancel.cancelled() => return StepResult::failed(CANCELED).with_usage(usage),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                engine.model_breaker.record_failure();
                return StepResult::failed(format!("model call failed: {e}")).with_usage(usage)
            }
        };
        engine.model_breaker.record_success();
        usage.add(response.usage);

        let mut assistant = ChatMessage::assistant(response.text.clone());
        assistant.tool_calls = response.tool_calls.clone();
        messages.push(assistant);

        if response.tool_calls.is_empty() {
            return finalize(step, response.text, usage);
        }

        for call in &response.tool_calls {
            engine.bus.publish(EngineEvent::ToolCalled {
                run_id: run_ctx.run_id,
                step_id: step.id.clone(),
                tool: call.name.clone(),
            });
            audit(
                engine,
                &EngineEvent::ToolCalled {
                    run_id: run_ctx.run_id,
                    step_id: step.id.clone(),
                    tool: call.name.clone(),
                },
            )
            .await;

            match call.name.as_str() {
                "ask" => {
                    match handle_ask(engine, run_ctx, step, call, &messages, usage).await {
                        AskOutcome::Answered(result) => messages.push(result),
                        AskOutcome::Suspend(result) => return result,
                    }
                }
                "transfer_to_agent" => {
                    let target = call
                        .args
                        .get("agent")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if handoffs >= max_handoffs {
                        messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            format!("handoff limit ({max_handoffs}) reached"),
                        ));
                        continue;
                    }
                    match engine.agents.get(target) {
                        Some(profile) => {
                            handoffs += 1;
                            engine.bus.publish(EngineEvent::AgentHandoff {
                                run_id: run_ctx.run_id,
                                step_id: step.id.clone(),
                                from_agent: current_agent.clone(),
                                to_agent: profile.name.clone(),
                            });
                            current_agent = Some(profile.name.clone());
                            current_system = Some(profile.system.clone());
                            current_model = profile.model.clone().or(current_model);
                            agent_tools = profile.tools.clone();
                            tool_defs =
                                build_tool_defs(engine, &agent_tools, tools, &mcp_tools);
                            messages.push(ChatMessage::tool_result(
                                call.id.clone(),
                                format!("transferred to agent '{target}'"),
                            ));
                        }
                        None => messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            format!("unknown agent '{target}'"),
                        )),
                    }
                }
                name => {
                    let result = invoke_tool(engine, &agent_tools, tools, &mcp_tools, call, name)
                        .await;
                    messages.push(ChatMessage::tool_result(call.id.clone(), result));
                }
            }
        }
    }

    StepResult::failed(format!(
        "reached maximum iterations ({max_iterations}) without a final answer"
    ))
    .with_usage(usage)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

enum AskOutcome {
    Answered(ChatMessage),
    Suspend(StepResult),
}

async fn handle_ask<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    run_ctx: &RunContext,
    step: &Step,
    call: &ToolCall,
    messages: &[ChatMessage],
    usage: TokenUsage,
) -> AskOutcome {
    let question = call
        .args
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or("(no question)")
        .to_string();

    if let Some(prompter) = &engine.prompter {
        return match prompter.ask(&question).await {
            Ok(answer) => AskOutcome::Answered(ChatMessage::tool_result(call.id.clone(), answer)),
            Err(e) => AskOutcome::Answered(ChatMessage::tool_result(
                call.id.clone(),
                format!("prompt failed: {e}"),
            )),
        };
    }

    let event = ask_event_name(run_ctx, &step.id);
    if let Err(e) = engine
        .store
        .create_suspension(&run_ctx.run_id, &step.id, &event)
        .await
    {
        return AskOutcome::Answered(ChatMessage::tool_result(
            call.id.clone(),
            format!("failed to record suspension: {e}"),
        ));
    }

    AskOutcome::Suspend(
        StepResult::suspended(json!({
            "question": question,
            "messages": messages,
            "call_id": call.id,
            "event": event,
        }))
        .with_usage(usage),
    )
}

async fn invoke_tool<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    agent_tools: &[String],
    step_tools: &[String],
    mcp_tools: &HashMap<String, (Arc<dyn McpClient>, ToolDef)>,
    call: &ToolCall,
    name: &str,
) -> String {
    let active: HashSet<&str> = agent_tools
        .iter()
        .chain(step_tools.iter())
        .map(String::as_str)
        .collect();

    if active.contains(name) {
        if let Some((_, handler)) = engine.tools.get(name) {
            return match (handler.as_ref())(call.args.clone()).await {
                Ok(value) => value.to_string(),
                Err(e) => format!("tool '{name}' failed: {e}"),
            };
        }
    }

    if let Some((client, _)) = mcp_tools.get(name) {
        return match client.call_tool(name, call.args.clone()).await {
            Ok(value) => value.to_string(),
            Err(e) => format!("tool '{name}' failed: {e}"),
        };
    }

    format!("unknown tool '{name}'")
}

/// Assemble the tool definitions visible to the model right now: the active
/// agent's tools, the step's own tools, every discovered MCP tool, plus the
/// `ask` and `transfer_to_agent` builtins.
fn build_tool_defs<S: StateStore>(
    engine: &Arc<EngineContext<S>>,
    agent_tools: &[String],
    step_tools: &[String],
    mcp_tools: &HashMap<String, (Arc<dyn McpClient>, ToolDef)>,
) -> Vec<ToolDef> {
    let mut seen = HashSet::new();
    let mut defs = Vec::new();

    let names: Vec<String> = agent_tools
        .iter()
        .chain(step_tools.iter())
        .cloned()
        .collect();
    for def in engine.tools.defs_for(&names) {
        if seen.insert(def.name.clone()) {
            defs.push(def);
        }
    }
    for (_, def) in mcp_tools.values() {
        if seen.insert(def.name.clone()) {
            defs.push(def.clone());
        }
    }

    defs.push(ToolDef {
        name: "ask".to_string(),
        description: Some("Ask the human operator a question and wait for the answer".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": { "question": { "type": "string" } },
            "required": ["question"]
        }),
    });
    if !engine.agents.is_empty() {
        defs.push(ToolDef {
            name: "transfer_to_agent".to_string(),
            description: Some("Hand the conversation to a different agent".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "agent": { "type": "string" } },
                "required": ["agent"]
            }),
        });
    }
    defs
}

/// Wrap up a final text answer, parsing it as JSON when the step declares an
/// output schema.
fn finalize(step: &Step, text: String, usage: TokenUsage) -> StepResult {
    if step.output_schema.is_some() {
        match extract_json(&text) {
            Some(value) => StepResult::success(value).with_usage(usage),
            None => StepResult::failed(
                EngineError::Schema {
                    message: "final answer is not parseable JSON".to_string(),
                    step_id: Some(step.id.clone()),
                }
                .to_string(),
            )
            .with_usage(usage),
        }
    } else {
        StepResult::success(Value::String(text)).with_usage(usage)
    }
}
