//! Canonical OpenAI-shaped wire types the relay accepts and emits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The OpenAI-shaped request body, shared by every relay mode. Fields the
/// mode does not use stay `None`/`Null` and are skipped on re-serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// String or array of strings.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub prompt: Value,
    /// String or array of strings.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAIError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub param: String,
    /// String in practice, but some upstreams send numbers.
    #[serde(default)]
    pub code: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// The slice of a buffered upstream response the relay inspects: usage for
/// settlement and the error envelope for pass-through.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextResponse {
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub error: Option<OpenAIError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextResponseChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// Full non-streaming chat response, synthesized when translating a Claude
/// response into the canonical shape.
#[derive(Debug, Clone, Serialize)]
pub struct FullTextResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub choices: Vec<TextResponseChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` frame, both as parsed off an OpenAI upstream
/// stream and as emitted when translating a Claude stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsStreamResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionsStreamChoice {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionsStreamResponse {
    #[serde(default)]
    pub choices: Vec<CompletionsStreamChoice>,
}

impl OpenAIError {
    /// The `code` as a string, however the upstream spelled it.
    pub fn code_string(&self) -> String {
        match self.code.as_str() {
            Some(code) => code.to_string(),
            None if self.code.is_null() => String::new(),
            None => self.code.to_string(),
        }
    }
}
