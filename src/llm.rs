//! LLM Client
//!
//! Chat-completion client used by every decision node. The pipeline only sees
//! the `ChatModel` trait; the reqwest-backed `LlmClient` is the production
//! implementation and tests substitute scripted fakes.

use crate::error::{PilotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Message in chat-completion format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            name: None,
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: String, // JSON string
}

/// Response from one inference call.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Inference seam used by every LLM-driven node.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse>;
}

/// Strip markdown code fences the model sometimes wraps JSON in.
pub fn clean_json_response(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// OpenAI-style chat-completion client.
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    /// Build a client from OPENAI_API_KEY / OPENAI_BASE_URL.
    pub fn from_env(model: String) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PilotError::Config("OPENAI_API_KEY not set".to_string()))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self::new(api_key, model, base_url))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn apply_token_limit(&self, body: &mut serde_json::Value) {
        // Newer models take max_completion_tokens; reasoning models need extra
        // headroom for reasoning tokens on top of the completion itself.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(4000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(1500);
        } else {
            body["max_tokens"] = serde_json::json!(1500);
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.1,
        });
        self.apply_token_limit(&mut body);

        if let Some(tools) = tools {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(api_tools);
            body["tool_choice"] = serde_json::json!("auto");
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PilotError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PilotError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PilotError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(PilotError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PilotError::Llm("No choices in LLM response".to_string()))?;

        let message = &choices[0]["message"];

        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "content_filter" {
                return Err(PilotError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
            if finish_reason == "length" {
                tracing::warn!("LLM response truncated at the token limit");
            }
        }

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let name = call["function"]["name"]
                    .as_str()
                    .ok_or_else(|| PilotError::Llm("Tool call without a name".to_string()))?
                    .to_string();
                let arguments = call["function"]["arguments"]
                    .as_str()
                    .unwrap_or("{}")
                    .to_string();
                tool_calls.push(ToolCallRequest { name, arguments });
            }
        }

        if content.is_empty() && tool_calls.is_empty() {
            return Err(PilotError::Llm(
                "Empty content and no tool calls in LLM response".to_string(),
            ));
        }

        Ok(LlmResponse {
            content,
            tool_calls,
        })
    }
}
