//! The language-model seam: the [`LanguageModel`] trait the engine consumes,
//! its object-safe [`BoxLanguageModel`] wrapper, the tool registry, agent
//! profiles, the prompter seam for interactive steps, and the JSON
//! extraction used to enforce llm output schemas.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use strand_types::llm::{CompletionRequest, CompletionResponse, LlmError, ToolDef};

// ---------------------------------------------------------------------------
// LanguageModel trait + type erasure
// ---------------------------------------------------------------------------

/// Abstract model handle. The protocol adapter (provider name -> streaming
/// chat call) lives outside the engine and implements this trait.
pub trait LanguageModel: Send + Sync {
    /// Adapter name, for logs.
    fn name(&self) -> &str;

    /// One completion turn: full message list in, text + tool calls out.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, LlmError>> + Send;
}

/// Object-safe version of [`LanguageModel`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch; a blanket impl covers every
/// `LanguageModel`.
pub trait LanguageModelDyn: Send + Sync {
    fn name(&self) -> &str;

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + 'a>>;
}

impl<T: LanguageModel> LanguageModelDyn for T {
    fn name(&self) -> &str {
        LanguageModel::name(self)
    }

    fn complete_boxed<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + 'a>> {
        Box::pin(self.complete(request))
    }
}

/// Type-erased model handle for runtime adapter selection.
pub struct BoxLanguageModel {
    inner: Box<dyn LanguageModelDyn>,
}

impl BoxLanguageModel {
    pub fn new<T: LanguageModel + 'static>(model: T) -> Self {
        Self {
            inner: Box::new(model),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.inner.complete_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

/// Async tool handler: JSON args in, JSON result (or error text) out.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Named tools available to llm steps.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDef, ToolHandler)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; replaces any existing tool with the same name.
    pub fn register(&mut self, def: ToolDef, handler: ToolHandler) {
        self.tools.insert(def.name.clone(), (def, handler));
    }

    pub fn get(&self, name: &str) -> Option<&(ToolDef, ToolHandler)> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions for the named subset, skipping unknown names.
    pub fn defs_for(&self, names: &[String]) -> Vec<ToolDef> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name).map(|(def, _)| def.clone()))
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Agent profiles
// ---------------------------------------------------------------------------

/// A named agent an llm step can run as (and hand off to).
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    /// System prompt installed while this agent holds the conversation.
    pub system: String,
    /// Tool names from the registry this agent may call.
    pub tools: Vec<String>,
    /// Model override.
    pub model: Option<String>,
}

// ---------------------------------------------------------------------------
// Prompter
// ---------------------------------------------------------------------------

/// Interactive input seam for `human` steps and the llm `ask` builtin.
///
/// Object-safe by construction (boxed future) because the engine context
/// stores it as `Arc<dyn Prompter>`. Headless deployments attach none, which
/// makes those steps suspend instead of prompting.
pub trait Prompter: Send + Sync {
    fn ask<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<String, String>>;
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Pull a JSON value out of model text: the whole text, a fenced
/// ```json``` block, or the first balanced `{…}` / `[…]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Fenced block: ```json … ``` or bare ``` … ```.
    if let Some(open) = trimmed.find("```") {
        let after = &trimmed[open + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        let after = after.trim_start_matches(['\r', '\n']);
        if let Some(close) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..close].trim()) {
                return Some(value);
            }
        }
    }

    // First balanced object or array span.
    for opener in ['{', '['] {
        if let Some(start) = trimmed.find(opener) {
            if let Some(span) = balanced_span(&trimmed[start..], opener) {
                if let Ok(value) = serde_json::from_str(span) {
                    return Some(value);
                }
            }
        }
    }

    None
}

fn balanced_span(input: &str, opener: char) -> Option<&str> {
    let closer = if opener == '{' { '}' } else { ']' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == opener => depth += 1,
            c if c == closer => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
