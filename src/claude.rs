//! Claude dialect adapter: pure translation between the canonical OpenAI
//! shape and the Anthropic completion API. No I/O happens here; the
//! orchestrator decides when to call these.

use crate::error::AppError;
use crate::openai::{
    ChatCompletionsStreamResponse, ChatStreamChoice, FullTextResponse, Message, StreamDelta,
    TextRequest, TextResponseChoice, Usage,
};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Ceiling used when the canonical request does not bound the sampling
/// length; the upstream stops on its own stop sequences instead.
const UNBOUNDED_MAX_TOKENS: u32 = 1_000_000;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens_to_sample: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeResponse {
    #[serde(default)]
    pub completion: String,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub error: Option<ClaudeError>,
}

fn stop_reason_to_openai(reason: &str) -> String {
    match reason {
        "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

/// Builds the Claude completion request from the canonical chat shape. The
/// message list is flattened into the legacy turn-prefixed prompt, closed
/// with an open assistant turn.
pub fn request_from_openai(req: &TextRequest) -> ClaudeRequest {
    let mut prompt = String::new();
    for message in &req.messages {
        match message.role.as_str() {
            "user" => {
                prompt.push_str("\n\nHuman: ");
                prompt.push_str(&message.content);
            }
            "assistant" => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&message.content);
            }
            "system" => {
                prompt.push_str("\n\nSystem: ");
                prompt.push_str(&message.content);
            }
            _ => {}
        }
    }
    prompt.push_str("\n\nAssistant:");

    ClaudeRequest {
        model: req.model.clone(),
        prompt,
        max_tokens_to_sample: req.max_tokens.unwrap_or(UNBOUNDED_MAX_TOKENS),
        stop_sequences: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
    }
}

/// Full non-streaming translation. Synthesizes the response id and created
/// timestamp; usage is filled in by the caller once tokens are counted.
pub fn response_to_openai(resp: &ClaudeResponse) -> FullTextResponse {
    FullTextResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        choices: vec![TextResponseChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: resp.completion.clone(),
                name: None,
            },
            finish_reason: stop_reason_to_openai(&resp.stop_reason),
        }],
        usage: Usage::default(),
    }
}

/// Translates one streaming event into a `chat.completion.chunk`. The
/// caller supplies a stable `id` and `created` so downstream consumers can
/// correlate every chunk of the stream.
pub fn stream_response_to_openai(
    resp: &ClaudeResponse,
    id: &str,
    created: i64,
) -> ChatCompletionsStreamResponse {
    let finish_reason = if resp.stop_reason.is_empty() {
        None
    } else {
        Some(stop_reason_to_openai(&resp.stop_reason))
    };
    ChatCompletionsStreamResponse {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![ChatStreamChoice {
            delta: StreamDelta {
                content: Some(resp.completion.clone()),
            },
            finish_reason,
        }],
    }
}

/// Maps an upstream Claude error into the canonical envelope, preserving
/// the upstream status and carrying the Claude error type as the code.
pub fn error_to_app(err: &ClaudeError, status: StatusCode) -> AppError {
    AppError::new(status, err.error_type.clone(), err.message.clone())
        .with_type(err.error_type.clone())
        .with_param("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(messages: Vec<(&str, &str)>) -> TextRequest {
        TextRequest {
            model: "claude-2".to_string(),
            messages: messages
                .into_iter()
                .map(|(role, content)| Message {
                    role: role.to_string(),
                    content: content.to_string(),
                    name: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn prompt_flattens_turns_and_opens_assistant() {
        let req = chat_request(vec![
            ("system", "be terse"),
            ("user", "hi"),
            ("assistant", "hello"),
            ("user", "bye"),
        ]);
        let claude = request_from_openai(&req);
        assert_eq!(
            claude.prompt,
            "\n\nSystem: be terse\n\nHuman: hi\n\nAssistant: hello\n\nHuman: bye\n\nAssistant:"
        );
        assert_eq!(claude.max_tokens_to_sample, UNBOUNDED_MAX_TOKENS);
    }

    #[test]
    fn max_tokens_is_forwarded() {
        let mut req = chat_request(vec![("user", "hi")]);
        req.max_tokens = Some(256);
        assert_eq!(request_from_openai(&req).max_tokens_to_sample, 256);
    }

    #[test]
    fn stop_reasons_map_to_openai_vocabulary() {
        assert_eq!(stop_reason_to_openai("stop_sequence"), "stop");
        assert_eq!(stop_reason_to_openai("max_tokens"), "length");
        assert_eq!(stop_reason_to_openai("other"), "other");
    }

    #[test]
    fn stream_chunk_uses_caller_identity() {
        let resp = ClaudeResponse {
            completion: "Hel".to_string(),
            ..Default::default()
        };
        let chunk = stream_response_to_openai(&resp, "chatcmpl-abc", 1700000000);
        assert_eq!(chunk.id, "chatcmpl-abc");
        assert_eq!(chunk.created, 1700000000);
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn upstream_error_keeps_type_as_code() {
        let err = ClaudeError {
            error_type: "overloaded_error".to_string(),
            message: "busy".to_string(),
        };
        let app = error_to_app(&err, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(app.code, "overloaded_error");
        assert_eq!(app.error_type, "overloaded_error");
        assert_eq!(app.param.as_deref(), Some(""));
        assert_eq!(app.status, StatusCode::TOO_MANY_REQUESTS);
    }
}
