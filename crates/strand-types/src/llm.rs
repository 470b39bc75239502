//! Language-model wire types.
//!
//! Strand consumes an abstract model handle; the protocol adapter that turns
//! a provider name into an HTTP client lives outside this workspace. These
//! types model the conversation surface the engine needs: messages that
//! survive agent handoffs, tool definitions and calls, and usage accounting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::TokenUsage;

/// Role of a message in a model conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a model conversation.
///
/// Tool-result messages carry the originating call id so the adapter can
/// thread results back to the right invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: vec![],
        }
    }
}

/// A tool the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments.
    pub input_schema: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// A completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// A complete model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Concatenated text content.
    pub text: String,
    /// Tool invocations requested in this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Errors from the model adapter.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model stream failed: {0}")]
    Stream(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("model response malformed: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::tool_result("call_1", "42");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(msg.tool_calls.is_empty());

        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert!(msg.tool_call_id.is_none());
    }

    #[test]
    fn test_completion_request_roundtrip() {
        let req = CompletionRequest {
            model: Some("sonnet".to_string()),
            system: Some("You are a reviewer".to_string()),
            messages: vec![ChatMessage::user("review this")],
            tools: vec![ToolDef {
                name: "search".to_string(),
                description: Some("Search the index".to_string()),
                input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            }],
            max_tokens: Some(1024),
            temperature: None,
        };
        let encoded = serde_json::to_string(&req).unwrap();
        let back: CompletionRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.tools.len(), 1);
        assert_eq!(back.messages[0].content, "review this");
    }

    #[test]
    fn test_tool_call_roundtrip() {
        let response = CompletionResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "transfer_to_agent".to_string(),
                args: json!({"agent": "reviewer"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
        };
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["stop_reason"], "tool_use");
        let back: CompletionResponse = serde_json::from_value(encoded).unwrap();
        assert_eq!(back.tool_calls[0].name, "transfer_to_agent");
        assert_eq!(back.usage.total(), 120);
    }
}
