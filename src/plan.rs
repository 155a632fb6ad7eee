//! Request planning: parse and validate the inbound body per relay mode,
//! apply channel model remapping, pick the upstream dialect, and build the
//! upstream URL.

use crate::config;
use crate::context::{ApiType, ChannelType, RelayMode, RequestContext};
use crate::error::{AppError, AppResult};
use crate::openai::TextRequest;
use axum::http::StatusCode;
use serde_json::Value;
use std::collections::HashMap;

/// Everything the orchestrator needs to dispatch one request upstream.
#[derive(Debug, Clone)]
pub struct RelayPlan {
    pub text_request: TextRequest,
    /// The body must be re-serialized from `text_request` before forwarding
    /// (the original bytes carry the unmapped model name).
    pub is_model_mapped: bool,
    pub api_type: ApiType,
    pub upstream_url: String,
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn required(message: &str) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "required_field_missing", message)
}

/// Builds the relay plan. `path_and_query` is the original request target
/// (path plus query, both preserved on pass-through); `path_model` is the
/// `{model}` route segment for the embeddings surface.
pub fn plan_request(
    ctx: &RequestContext,
    mode: RelayMode,
    path_and_query: &str,
    path_model: Option<&str>,
    body: &[u8],
) -> AppResult<RelayPlan> {
    // The body is only materialized when something downstream needs the
    // fields; otherwise the raw bytes are forwarded untouched.
    let must_parse = ctx.consume_quota
        || ctx.channel_type == ChannelType::Azure
        || ctx.channel_type == ChannelType::PaLM;
    let mut text_request = if must_parse {
        serde_json::from_slice::<TextRequest>(body)
            .map_err(|err| AppError::wrap("bind_request_body_failed", StatusCode::BAD_REQUEST, err))?
    } else {
        TextRequest::default()
    };

    if mode == RelayMode::Moderations && text_request.model.is_empty() {
        text_request.model = "text-moderation-latest".to_string();
    }
    if mode == RelayMode::Embeddings && text_request.model.is_empty() {
        text_request.model = path_model.unwrap_or_default().to_string();
    }

    if text_request.model.is_empty() {
        return Err(required("model is required"));
    }
    match mode {
        RelayMode::Completions => {
            if value_is_empty(&text_request.prompt) {
                return Err(required("field prompt is required"));
            }
        }
        RelayMode::ChatCompletions => {
            if text_request.messages.is_empty() {
                return Err(required("field messages is required"));
            }
        }
        RelayMode::Moderations => {
            if value_is_empty(&text_request.input) {
                return Err(required("field input is required"));
            }
        }
        RelayMode::Edits => {
            if text_request.instruction.is_empty() {
                return Err(required("field instruction is required"));
            }
        }
        RelayMode::Embeddings => {}
    }

    let mut is_model_mapped = false;
    if let Some(raw_mapping) = &ctx.model_mapping {
        let mapping: HashMap<String, String> =
            serde_json::from_str(raw_mapping).map_err(|err| {
                AppError::wrap(
                    "unmarshal_model_mapping_failed",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err,
                )
            })?;
        if let Some(mapped) = mapping.get(&text_request.model) {
            if !mapped.is_empty() {
                text_request.model = mapped.clone();
                is_model_mapped = true;
            }
        }
    }

    let api_type = if text_request.model.starts_with("claude") {
        ApiType::Claude
    } else {
        ApiType::OpenAI
    };

    let upstream_url = build_upstream_url(ctx, api_type, path_and_query, &text_request.model);

    Ok(RelayPlan {
        text_request,
        is_model_mapped,
        api_type,
        upstream_url,
    })
}

fn query_param(path_and_query: &str, name: &str) -> Option<String> {
    let query = path_and_query.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn build_upstream_url(
    ctx: &RequestContext,
    api_type: ApiType,
    path_and_query: &str,
    model: &str,
) -> String {
    let base_url = ctx
        .base_url
        .clone()
        .unwrap_or_else(|| config::channel_base_url(ctx.channel_type).to_string());

    match api_type {
        ApiType::OpenAI if ctx.channel_type == ChannelType::Azure => {
            // Deployment-style URL: the query is dropped, the task is the
            // path without its /v1/ prefix, and the deployment name is the
            // model with dots removed and date suffixes trimmed.
            let api_version = query_param(path_and_query, "api-version")
                .or_else(|| ctx.api_version.clone())
                .unwrap_or_default();
            let path = path_and_query.split('?').next().unwrap_or_default();
            let task = path.strip_prefix("/v1/").unwrap_or(path);
            let mut deployment = model.replace('.', "");
            for suffix in ["-0301", "-0314", "-0613"] {
                if let Some(trimmed) = deployment.strip_suffix(suffix) {
                    deployment = trimmed.to_string();
                }
            }
            format!("{base_url}/openai/deployments/{deployment}/{task}?api-version={api_version}")
        }
        ApiType::Claude => {
            let base = ctx
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string());
            format!("{base}/v1/complete")
        }
        _ => format!("{base_url}{path_and_query}"),
    }
}
