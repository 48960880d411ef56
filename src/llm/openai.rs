//! OpenAI LLM bridge implementation.
//!
//! Enable with the `openai` feature flag.

use crate::llm::{LlmBridge, ModelParams, Plan, TokenUsage};
use crate::types::{CoreError, Message, MessageRole, Result, ToolCall, ToolSpec};
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionTools,
        CreateChatCompletionRequestArgs, FunctionObject,
    },
    Client,
};
use async_trait::async_trait;

/// Bridge to OpenAI's chat-completions API and compatible endpoints.
pub struct OpenAiBridge {
    client: Client<OpenAIConfig>,
    model: String,
    params: ModelParams,
}

impl OpenAiBridge {
    /// Create a new bridge targeting the default OpenAI API base.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_params(api_key, model, ModelParams::default())
    }

    /// Create a new bridge with explicit model parameters.
    pub fn with_params(api_key: String, model: String, params: ModelParams) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            model,
            params,
        }
    }

    fn convert_tool(tool: &ToolSpec) -> ChatCompletionTools {
        ChatCompletionTools::Function(ChatCompletionTool {
            function: FunctionObject {
                name: tool.qualified_name(),
                description: Some(tool.description.clone()),
                parameters: Some(tool.parameters.clone()),
                strict: None,
            },
        })
    }

    fn extract_tool_calls(tool_calls: &[ChatCompletionMessageToolCalls]) -> Vec<ToolCall> {
        tool_calls
            .iter()
            .filter_map(|wrapper| match wrapper {
                ChatCompletionMessageToolCalls::Function(call) => {
                    let (server_name, name) = split_qualified_name(&call.function.name);
                    Some(ToolCall {
                        id: call.id.clone(),
                        server_name,
                        name,
                        arguments: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::json!({})),
                    })
                }
                ChatCompletionMessageToolCalls::Custom(_) => None,
            })
            .collect()
    }

    fn build_messages(transcript: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>> {
        transcript
            .iter()
            .map(|m| match m.role {
                MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.as_str())
                    .build()
                    .map(ChatCompletionRequestMessage::User)
                    .map_err(|e| CoreError::ModelUnavailable(format!("failed to build message: {e}"))),
                MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.as_str())
                    .build()
                    .map(ChatCompletionRequestMessage::Assistant)
                    .map_err(|e| CoreError::ModelUnavailable(format!("failed to build message: {e}"))),
                MessageRole::Tool => {
                    let tool_call_id = m
                        .metadata
                        .as_ref()
                        .and_then(|v| v.get("tool_call_id"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.as_str())
                        .tool_call_id(tool_call_id)
                        .build()
                        .map(ChatCompletionRequestMessage::Tool)
                        .map_err(|e| CoreError::ModelUnavailable(format!("failed to build message: {e}")))
                }
            })
            .collect()
    }
}

fn split_qualified_name(qualified: &str) -> (String, String) {
    match qualified.split_once('/') {
        Some((server, name)) => (server.to_string(), name.to_string()),
        None => (String::new(), qualified.to_string()),
    }
}

#[async_trait]
impl LlmBridge for OpenAiBridge {
    async fn plan(
        &self,
        transcript: &[Message],
        tools: &[ToolSpec],
        params: &ModelParams,
    ) -> Result<(Plan, TokenUsage)> {
        let openai_tools: Vec<ChatCompletionTools> = tools.iter().map(Self::convert_tool).collect();
        let messages = Self::build_messages(transcript)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model);
        builder.messages(messages);
        if !openai_tools.is_empty() {
            builder.tools(openai_tools);
        }

        let effective = merge_params(&self.params, params);
        if let Some(temp) = effective.temperature {
            builder.temperature(temp);
        }
        if let Some(max_tokens) = effective.max_tokens {
            builder.max_completion_tokens(max_tokens);
        }
        if let Some(top_p) = effective.top_p {
            builder.top_p(top_p);
        }

        let request = builder
            .build()
            .map_err(|e| CoreError::MalformedPlan(format!("failed to build request: {e}")))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            CoreError::ModelUnavailable(format!("OpenAI API error: {e}"))
        })?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| CoreError::ModelUnavailable("no response choices from OpenAI".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .map(|calls| Self::extract_tool_calls(calls))
            .unwrap_or_default();

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens as u32, u.completion_tokens as u32))
            .unwrap_or_default();

        let plan = if !tool_calls.is_empty() {
            Plan::ToolCalls(tool_calls)
        } else {
            let content = choice.message.content.clone().unwrap_or_default();
            Plan::Final(content)
        };

        Ok((plan, usage))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn merge_params(base: &ModelParams, overrides: &ModelParams) -> ModelParams {
    ModelParams {
        temperature: overrides.temperature.or(base.temperature),
        max_tokens: overrides.max_tokens.or(base.max_tokens),
        top_p: overrides.top_p.or(base.top_p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_reports_its_model_name() {
        let bridge = OpenAiBridge::new("test-key".to_string(), "gpt-4o-mini".to_string());
        assert_eq!(bridge.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn tool_conversion_qualifies_the_function_name() {
        let tool = ToolSpec {
            server_name: "calc_server".to_string(),
            name: "add".to_string(),
            description: "Adds two numbers".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }),
        };

        match OpenAiBridge::convert_tool(&tool) {
            ChatCompletionTools::Function(chat_tool) => {
                assert_eq!(chat_tool.function.name, "calc_server/add");
            }
            ChatCompletionTools::Custom(_) => panic!("expected Function variant"),
        }
    }

    #[test]
    fn qualified_name_splits_into_server_and_tool() {
        assert_eq!(
            split_qualified_name("calc_server/add"),
            ("calc_server".to_string(), "add".to_string())
        );
    }
}
