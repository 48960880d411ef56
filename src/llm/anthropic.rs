//! Anthropic Claude LLM bridge implementation.
//!
//! Enable with the `anthropic` feature flag.

use crate::llm::{LlmBridge, ModelParams, Plan, TokenUsage};
use crate::types::{CoreError, Message, MessageRole, Result, ToolCall, ToolSpec};
use async_trait::async_trait;
use claude_sdk::{ClaudeClient, ContentBlock, Message as ClaudeMessage, MessagesRequest, StopReason, Tool};

/// Bridge to the Anthropic Messages API.
pub struct AnthropicBridge {
    client: ClaudeClient,
    model: String,
    params: ModelParams,
}

impl AnthropicBridge {
    /// Create a new bridge.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_params(api_key, model, ModelParams::default())
    }

    /// Create a new bridge with explicit model parameters.
    pub fn with_params(api_key: String, model: String, params: ModelParams) -> Self {
        Self {
            client: ClaudeClient::anthropic(api_key),
            model,
            params,
        }
    }

    fn max_tokens(&self, overrides: &ModelParams) -> u32 {
        overrides
            .max_tokens
            .or(self.params.max_tokens)
            .unwrap_or(1024)
    }

    fn convert_tool(tool: &ToolSpec) -> Tool {
        Tool {
            name: tool.qualified_name(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
            disable_user_input: None,
            input_examples: None,
            cache_control: None,
        }
    }

    fn extract_text_content(content: &[ContentBlock]) -> String {
        content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn extract_tool_calls(content: &[ContentBlock]) -> Vec<ToolCall> {
        content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input, .. } => {
                    let (server_name, name) = split_qualified_name(name);
                    Some(ToolCall {
                        id: id.clone(),
                        server_name,
                        name,
                        arguments: input.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    fn build_request(&self, transcript: &[Message], tools: Vec<Tool>, max_tokens: u32, effective: &ModelParams) -> MessagesRequest {
        let messages = transcript
            .iter()
            .map(|m| match m.role {
                MessageRole::User => ClaudeMessage::user(m.content.clone()),
                MessageRole::Assistant => ClaudeMessage::assistant(m.content.clone()),
                // Claude expects tool results as user-turn content; folding the
                // synthetic tool message into a user turn keeps the transcript's
                // alternating-role shape intact.
                MessageRole::Tool => ClaudeMessage::user(m.content.clone()),
            })
            .collect();

        let mut request = MessagesRequest::new(self.model.clone(), max_tokens, messages);
        if let Some(temp) = effective.temperature {
            request = request.with_temperature(temp);
        }
        if !tools.is_empty() {
            request = request.with_tools(tools);
        }
        request
    }

    fn stop_reason_to_string(reason: Option<StopReason>) -> String {
        match reason {
            Some(StopReason::EndTurn) => "end_turn".to_string(),
            Some(StopReason::MaxTokens) => "max_tokens".to_string(),
            Some(StopReason::StopSequence) => "stop_sequence".to_string(),
            Some(StopReason::ToolUse) => "tool_use".to_string(),
            Some(StopReason::PauseTurn) => "pause_turn".to_string(),
            Some(StopReason::Refusal) => "refusal".to_string(),
            None => "stop".to_string(),
        }
    }
}

fn split_qualified_name(qualified: &str) -> (String, String) {
    match qualified.split_once('/') {
        Some((server, name)) => (server.to_string(), name.to_string()),
        None => (String::new(), qualified.to_string()),
    }
}

fn merge_params(base: &ModelParams, overrides: &ModelParams) -> ModelParams {
    ModelParams {
        temperature: overrides.temperature.or(base.temperature),
        max_tokens: overrides.max_tokens.or(base.max_tokens),
        top_p: overrides.top_p.or(base.top_p),
    }
}

#[async_trait]
impl LlmBridge for AnthropicBridge {
    async fn plan(
        &self,
        transcript: &[Message],
        tools: &[ToolSpec],
        params: &ModelParams,
    ) -> Result<(Plan, TokenUsage)> {
        let effective = merge_params(&self.params, params);
        let max_tokens = self.max_tokens(params);
        let claude_tools: Vec<Tool> = tools.iter().map(Self::convert_tool).collect();
        let request = self.build_request(transcript, claude_tools, max_tokens, &effective);

        let response = self
            .client
            .send_message(request)
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("Anthropic API error: {e}")))?;

        let tool_calls = Self::extract_tool_calls(&response.content);
        let usage = TokenUsage::new(
            response.usage.input_tokens as u32,
            response.usage.output_tokens as u32,
        );

        let plan = if !tool_calls.is_empty() {
            Plan::ToolCalls(tool_calls)
        } else {
            let _finish_reason = Self::stop_reason_to_string(response.stop_reason);
            Plan::Final(Self::extract_text_content(&response.content))
        };

        Ok((plan, usage))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_reports_its_model_name() {
        let bridge = AnthropicBridge::new(
            "test-key".to_string(),
            "claude-3-5-sonnet-20241022".to_string(),
        );
        assert_eq!(bridge.model_name(), "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn tool_conversion_qualifies_the_tool_name() {
        let tool = ToolSpec {
            server_name: "calc_server".to_string(),
            name: "add".to_string(),
            description: "Adds two numbers".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let claude_tool = AnthropicBridge::convert_tool(&tool);
        assert_eq!(claude_tool.name, "calc_server/add");
    }

    #[test]
    fn stop_reason_conversion() {
        assert_eq!(
            AnthropicBridge::stop_reason_to_string(Some(StopReason::ToolUse)),
            "tool_use"
        );
        assert_eq!(AnthropicBridge::stop_reason_to_string(None), "stop");
    }
}
