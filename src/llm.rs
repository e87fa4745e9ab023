//! Interface to the language model.
//!
//! Provider SDKs live behind [`LlmService`]; the orchestrator and agent cores
//! only see these types and the [`LlmError`] taxonomy.

use crate::error::{LlmError, LlmUsage};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmOptions {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Tool advertised to the model. `parameters` is a JSON Schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// Tool whose arguments are a flat object of the given string properties,
    /// all required.
    pub fn with_string_args(name: &str, description: &str, args: &[(&str, &str)]) -> Self {
        let properties: Map<String, Value> = args
            .iter()
            .map(|(arg, desc)| {
                (
                    arg.to_string(),
                    json!({ "type": "string", "description": desc }),
                )
            })
            .collect();
        let required: Vec<&str> = args.iter().map(|(arg, _)| *arg).collect();

        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Structured action request extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_string(),
            arguments,
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }

    pub fn i64_arg(&self, key: &str) -> Option<i64> {
        self.arguments.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<LlmUsage>,
}

/// Raw text chunks of a streaming response.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Plain text completion.
    async fn generate(
        &self,
        messages: &[LlmMessage],
        options: &LlmOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// Completion constrained to tool calls.
    async fn use_tools(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        options: &LlmOptions,
    ) -> Result<Vec<ToolCall>, LlmError>;

    /// Streaming tool-call completion as `{"toolCalls":[...]}` text.
    ///
    /// Providers without streaming fall back to one chunk holding the whole
    /// `use_tools` result.
    async fn stream_tools(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        options: &LlmOptions,
    ) -> Result<ChunkStream, LlmError> {
        let calls = self.use_tools(messages, tools, options).await?;
        let body = serde_json::to_string(&json!({ "toolCalls": calls })).map_err(|e| {
            LlmError::InvalidContent {
                reason: format!("failed to encode tool calls: {}", e),
                usage: None,
            }
        })?;
        Ok(stream::iter([Ok(body)]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneShot;

    #[async_trait]
    impl LlmService for OneShot {
        async fn generate(
            &self,
            _messages: &[LlmMessage],
            _options: &LlmOptions,
        ) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: "ok".to_string(),
                usage: None,
            })
        }

        async fn use_tools(
            &self,
            _messages: &[LlmMessage],
            _tools: &[ToolDefinition],
            _options: &LlmOptions,
        ) -> Result<Vec<ToolCall>, LlmError> {
            Ok(vec![ToolCall::new("send_message", json!({ "message": "hi" }))])
        }
    }

    #[tokio::test]
    async fn test_default_stream_wraps_use_tools() {
        let chunks: Vec<_> = OneShot
            .stream_tools(&[], &[], &LlmOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        let body: Value = serde_json::from_str(chunks[0].as_ref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({ "toolCalls": [{ "name": "send_message", "arguments": { "message": "hi" } }] })
        );
    }

    #[test]
    fn test_tool_definition_schema() {
        let tool = ToolDefinition::with_string_args(
            "send_message",
            "Say something",
            &[("message", "What to say")],
        );
        assert_eq!(tool.parameters["type"], "object");
        assert_eq!(tool.parameters["properties"]["message"]["type"], "string");
        assert_eq!(tool.parameters["required"], json!(["message"]));
    }

    #[test]
    fn test_tool_call_argument_accessors() {
        let call = ToolCall::new("use_gimmick", json!({ "gimmickId": "7", "slot": 2, "note": "x" }));
        assert_eq!(call.i64_arg("gimmickId"), Some(7));
        assert_eq!(call.i64_arg("slot"), Some(2));
        assert_eq!(call.str_arg("note"), Some("x"));
        assert_eq!(call.str_arg("missing"), None);
    }
}
