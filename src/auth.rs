//! Token authentication and channel distribution. Runs ahead of the relay
//! core as an axum middleware: validates the caller's key, picks a channel
//! for the requested model, installs the channel credential in the
//! `Authorization` header, and attaches the immutable [`RequestContext`]
//! the core consumes.

use crate::app::AppState;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

/// Largest request body the relay will buffer.
pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub async fn distribute(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return AppError::wrap("bind_request_body_failed", StatusCode::BAD_REQUEST, err)
                .into_response();
        }
    };

    let path = parts.uri.path().to_string();
    match build_context(&state, &parts.headers, &path, &body_bytes).await {
        Ok((ctx, channel_key)) => {
            match HeaderValue::from_str(&format!("Bearer {channel_key}")) {
                Ok(value) => {
                    parts.headers.insert(header::AUTHORIZATION, value);
                }
                Err(err) => {
                    return AppError::wrap(
                        "invalid_channel_key",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        err,
                    )
                    .into_response();
                }
            }
            let mut request = Request::from_parts(parts, Body::from(body_bytes));
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

async fn build_context(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    path: &str,
    body: &Bytes,
) -> AppResult<(RequestContext, String)> {
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start_matches("Bearer ").trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "missing or malformed Authorization header",
            )
        })?;

    let token = state
        .store
        .token_by_key(key)
        .await
        .map_err(|err| {
            AppError::wrap("token_lookup_failed", StatusCode::INTERNAL_SERVER_ERROR, err)
        })?
        .ok_or_else(|| {
            AppError::new(StatusCode::UNAUTHORIZED, "invalid_api_key", "invalid api key")
        })?;

    let model = requested_model(path, body);
    let channel = state
        .store
        .channel_for_request(&token.group, &model)
        .await
        .map_err(|err| {
            AppError::wrap(
                "channel_lookup_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err,
            )
        })?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_available_channel",
                format!("no available channel for model {model}"),
            )
        })?;

    let ctx = RequestContext {
        channel_type: channel.channel_type,
        channel_id: channel.id,
        channel_name: channel.name,
        token_id: token.id,
        token_name: token.name,
        user_id: token.user_id,
        group: token.group,
        model_mapping: channel.model_mapping,
        base_url: channel.base_url,
        api_version: channel.api_version,
        consume_quota: !token.unlimited_quota,
    };
    Ok((ctx, channel.key))
}

/// The model used for channel selection: the body's `model` field, the
/// embeddings path segment, or the moderations default.
fn requested_model(path: &str, body: &Bytes) -> String {
    let from_body = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("model")
                .and_then(|model| model.as_str())
                .map(|model| model.to_string())
        })
        .unwrap_or_default();
    if !from_body.is_empty() {
        return from_body;
    }
    if let Some(rest) = path.strip_prefix("/v1/embeddings/") {
        if !rest.is_empty() {
            return rest.to_string();
        }
    }
    if path == "/v1/moderations" {
        return "text-moderation-latest".to_string();
    }
    String::new()
}
