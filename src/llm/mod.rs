//! LLM Bridge abstractions.
//!
//! A single `LlmBridge` trait abstracts over the model backend: given a
//! transcript and the current tool catalog, it returns a `Plan` — either a
//! batch of tool calls the planner should execute, or a final answer.
//!
//! Two concrete backends are provided, selected at runtime via
//! `Config::llm_provider` (`"openai"` or `"anthropic"`), each gated behind
//! its own Cargo feature.

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "openai")]
pub mod openai;

use crate::types::{CoreError, Message, Result, ToolCall, ToolSpec};
use async_trait::async_trait;

/// Sampling parameters forwarded to the model backend.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: Some(1024),
            top_p: None,
        }
    }
}

/// Token accounting for a single model round-trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens + other.prompt_tokens,
            self.completion_tokens + other.completion_tokens,
        )
    }
}

/// What the model decided to do with this turn. Tool calls take precedence:
/// if the model returns both text and tool calls in the same turn, the
/// tool calls are treated as the plan and the accompanying text is kept only
/// as commentary, not as a final answer.
#[derive(Debug, Clone)]
pub enum Plan {
    /// The model wants to invoke one or more tools before continuing.
    ToolCalls(Vec<ToolCall>),
    /// The model is done and this is its answer to the user.
    Final(String),
}

/// Provider-agnostic interface to a tool-calling-capable LLM.
#[async_trait]
pub trait LlmBridge: Send + Sync {
    /// Given the running transcript and the tools currently available,
    /// produce the model's next plan.
    async fn plan(
        &self,
        transcript: &[Message],
        tools: &[ToolSpec],
        params: &ModelParams,
    ) -> Result<(Plan, TokenUsage)>;

    /// Identifier of the model this bridge is configured to call.
    fn model_name(&self) -> &str;
}

/// Validate a tool call's arguments against its `ToolSpec` JSON Schema
/// before dispatch, catching the most common shape errors without pulling
/// in a full JSON-Schema validator crate: the overall value being an object
/// when the schema requires one, and presence of required properties.
pub fn validate_arguments(call: &ToolCall, spec: &ToolSpec) -> Result<()> {
    let schema = &spec.parameters;
    let Some(schema_type) = schema.get("type").and_then(|t| t.as_str()) else {
        return Ok(());
    };
    if schema_type == "object" && !call.arguments.is_object() {
        return Err(CoreError::MalformedPlan(format!(
            "{}: expected object arguments, got {}",
            call.name, call.arguments
        )));
    }
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let args = call.arguments.as_object();
        for key in required {
            let Some(key) = key.as_str() else { continue };
            let present = args.map(|o| o.contains_key(key)).unwrap_or(false);
            if !present {
                return Err(CoreError::MalformedPlan(format!(
                    "{}: missing required argument '{key}'",
                    call.name
                )));
            }
        }
    }
    Ok(())
}
