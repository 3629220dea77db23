//! Chat message types and the OpenAI chat-completions client.
//!
//! The client speaks the chat-completions wire format directly over reqwest.
//! Message structs mirror the wire shape so history serializes straight into
//! the request body and response choices deserialize straight back.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Message role. The system instruction is not part of stored history and is
/// injected at call time, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One history entry, in chat-completions wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Placeholder acknowledgement for an executed tool call. The handler's
    /// real return value is never fed back to the model; content stays empty.
    pub fn tool_result(call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(String::new()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

/// Function name plus JSON-encoded arguments, kept as the raw string the
/// provider sent so dispatch owns the parse (and the parse failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

/// A callable action presented to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Seam for the model backend so the scheduler can be driven by a scripted
/// completion source in tests.
pub trait CompletionBackend: Send + Sync {
    /// Run one completion over the given history and tool schemas.
    /// Returns one assistant message per choice (normally one).
    fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>>> + Send;
}

/// OpenAI chat-completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f64,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        }
    }
}

impl CompletionBackend for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_prompt,
        })];

        for message in history {
            messages.push(
                serde_json::to_value(message)
                    .map_err(|e| Error::BackendUnavailable(e.to_string()))?,
            );
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });

        if !tools.is_empty() {
            let tools: Vec<serde_json::Value> = tools.iter().map(|t| t.to_wire()).collect();
            body["tools"] = serde_json::json!(tools);
        }

        tracing::debug!(model = %self.model, history_len = history.len(), "running model");

        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        if !status.is_success() {
            let message = response_body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(Error::BackendUnavailable(format!(
                "OpenAI API error ({status}): {message}"
            )));
        }

        parse_completion_response(response_body)
    }
}

/// Extract the assistant message from every returned choice.
fn parse_completion_response(body: serde_json::Value) -> Result<Vec<ChatMessage>> {
    let choices = body["choices"]
        .as_array()
        .ok_or_else(|| Error::BackendUnavailable("missing choices array in response".into()))?;

    choices
        .iter()
        .map(|choice| {
            serde_json::from_value(choice["message"].clone())
                .map_err(|e| Error::BackendUnavailable(format!("malformed choice message: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_choice_with_tool_calls() {
        let body = serde_json::json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "update_priority",
                            "arguments": "{\"priority\": 2}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let messages = parse_completion_response(body).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, None);
        assert_eq!(messages[0].tool_calls.len(), 1);
        assert_eq!(messages[0].tool_calls[0].id, "call_abc");
        assert_eq!(messages[0].tool_calls[0].function.name, "update_priority");
    }

    #[test]
    fn parses_plain_text_choice() {
        let body = serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": "noted" }
            }]
        });

        let messages = parse_completion_response(body).unwrap();
        assert_eq!(messages[0].content.as_deref(), Some("noted"));
        assert!(messages[0].tool_calls.is_empty());
    }

    #[test]
    fn rejects_response_without_choices() {
        let body = serde_json::json!({ "error": { "message": "nope" } });
        assert!(parse_completion_response(body).is_err());
    }

    #[test]
    fn tool_result_serializes_with_call_id_and_empty_content() {
        let message = ChatMessage::tool_result("call_1");
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["content"], "");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert!(wire.get("tool_calls").is_none());
    }

    #[test]
    fn user_message_omits_tool_fields() {
        let wire = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hi");
        assert!(wire.get("tool_call_id").is_none());
    }
}
