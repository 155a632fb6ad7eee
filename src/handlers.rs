//! Route handlers and the top-level relay state machine: ingest → plan →
//! pre-consume → dispatch → respond (stream or buffered) → settle.

use crate::app::AppState;
use crate::claude::{self, ClaudeResponse};
use crate::config;
use crate::context::{ApiType, RelayMode, RequestContext};
use crate::error::{AppError, AppResult};
use crate::openai::{TextResponse, Usage};
use crate::plan;
use crate::quota::{self, SettleOutcome, Settlement};
use crate::stream;
use crate::token_count::{count_token_input, count_token_messages, count_token_text};
use crate::upstream;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models() -> impl IntoResponse {
    let data: Vec<_> = config::known_models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "owned_by": "relaymux",
            })
        })
        .collect();
    axum::Json(json!({ "object": "list", "data": data }))
}

pub async fn relay_chat_completions(State(state): State<AppState>, request: Request) -> Response {
    relay(state, request, RelayMode::ChatCompletions, None).await
}

pub async fn relay_completions(State(state): State<AppState>, request: Request) -> Response {
    relay(state, request, RelayMode::Completions, None).await
}

pub async fn relay_embeddings(State(state): State<AppState>, request: Request) -> Response {
    relay(state, request, RelayMode::Embeddings, None).await
}

pub async fn relay_embeddings_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
    request: Request,
) -> Response {
    relay(state, request, RelayMode::Embeddings, Some(model)).await
}

pub async fn relay_moderations(State(state): State<AppState>, request: Request) -> Response {
    relay(state, request, RelayMode::Moderations, None).await
}

pub async fn relay_edits(State(state): State<AppState>, request: Request) -> Response {
    relay(state, request, RelayMode::Edits, None).await
}

async fn relay(
    state: AppState,
    request: Request,
    mode: RelayMode,
    path_model: Option<String>,
) -> Response {
    metrics::counter!("relay_requests_total", "mode" => mode.as_str()).increment(1);
    match relay_text(state, request, mode, path_model).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(code = %err.code, status = %err.status, "relay failed");
            err.into_response()
        }
    }
}

async fn relay_text(
    state: AppState,
    request: Request,
    mode: RelayMode,
    path_model: Option<String>,
) -> AppResult<Response> {
    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "missing_request_context",
                "request context was not populated",
            )
        })?;

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    // The distribution middleware already buffered the body, so this is a
    // cheap copy of the bytes it re-attached.
    let raw_body = axum::body::to_bytes(body, crate::auth::BODY_LIMIT)
        .await
        .map_err(|err| {
            AppError::wrap("bind_request_body_failed", StatusCode::BAD_REQUEST, err)
        })?;

    let relay_plan = plan::plan_request(&ctx, mode, &path_and_query, path_model.as_deref(), &raw_body)?;
    let model = relay_plan.text_request.model.clone();

    let prompt_tokens = match mode {
        RelayMode::ChatCompletions => {
            count_token_messages(&relay_plan.text_request.messages, &model)
        }
        RelayMode::Completions => count_token_input(&relay_plan.text_request.prompt, &model),
        RelayMode::Moderations => count_token_input(&relay_plan.text_request.input, &model),
        _ => 0,
    };

    let quota_plan = quota::pre_consume(
        &state.store,
        &ctx,
        &model,
        prompt_tokens,
        relay_plan.text_request.max_tokens,
    )
    .await?;

    // Armed from here on. Any early return drops it, which settles the
    // exchange as failed and returns the pre-consumed debit.
    let settlement = Settlement::new(
        state.store.clone(),
        ctx.clone(),
        model.clone(),
        prompt_tokens,
        quota_plan,
    );

    let upstream_body = upstream::build_upstream_body(&relay_plan, &raw_body)?;
    let upstream_response = upstream::dispatch(
        &state.http,
        &ctx,
        &relay_plan,
        parts.method.clone(),
        &parts.headers,
        upstream_body,
    )
    .await
    .inspect_err(|_| {
        metrics::counter!("relay_upstream_errors_total").increment(1);
    })?;

    let is_stream = upstream_response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("text/event-stream"))
        .unwrap_or(false);

    match relay_plan.api_type {
        ApiType::OpenAI => {
            if is_stream {
                Ok(stream::relay_openai_stream(upstream_response, mode, settlement))
            } else {
                forward_openai_buffered(upstream_response, settlement, ctx.consume_quota).await
            }
        }
        ApiType::Claude => {
            if is_stream {
                Ok(stream::relay_claude_stream(upstream_response, settlement))
            } else {
                forward_claude_buffered(upstream_response, settlement, prompt_tokens, &model).await
            }
        }
        ApiType::PaLM => Err(AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unknown_api_type",
            "unknown api type",
        )),
    }
}

/// Buffered OpenAI-dialect forwarding. When quota is metered the body is
/// read once to extract usage and a possible upstream error envelope, then
/// re-materialized for the client; otherwise the bytes stream straight
/// through.
async fn forward_openai_buffered(
    upstream_response: reqwest::Response,
    settlement: Settlement,
    consume_quota: bool,
) -> AppResult<Response> {
    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();

    if !consume_quota {
        let mut response =
            Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        copy_first_header_values(&upstream_headers, response.headers_mut());
        drop(settlement); // unarmed when quota is off
        return Ok(response);
    }

    let body = upstream_response.bytes().await.map_err(|err| {
        AppError::wrap(
            "read_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err,
        )
    })?;
    let text_response: TextResponse = serde_json::from_slice(&body).map_err(|err| {
        AppError::wrap(
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err,
        )
    })?;
    if let Some(error) = &text_response.error {
        if !error.error_type.is_empty() {
            metrics::counter!("relay_upstream_errors_total").increment(1);
            return Err(AppError {
                status,
                code: error.code_string(),
                message: error.message.clone(),
                error_type: error.error_type.clone(),
                param: Some(error.param.clone()),
            });
        }
    }

    settlement
        .settle(SettleOutcome::Buffered {
            usage: text_response.usage,
        })
        .await;

    // Headers are copied only after the body parsed; a parse failure must
    // still produce a clean error envelope.
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    copy_first_header_values(&upstream_headers, response.headers_mut());
    Ok(response)
}

/// Buffered Claude-dialect forwarding: parse, surface upstream errors,
/// translate to the canonical shape, fill usage from counted tokens.
async fn forward_claude_buffered(
    upstream_response: reqwest::Response,
    settlement: Settlement,
    prompt_tokens: i64,
    model: &str,
) -> AppResult<Response> {
    let status = upstream_response.status();
    let body = upstream_response.bytes().await.map_err(|err| {
        AppError::wrap(
            "read_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err,
        )
    })?;
    let claude_response: ClaudeResponse = serde_json::from_slice(&body).map_err(|err| {
        AppError::wrap(
            "unmarshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err,
        )
    })?;
    if let Some(error) = &claude_response.error {
        if !error.error_type.is_empty() {
            metrics::counter!("relay_upstream_errors_total").increment(1);
            return Err(claude::error_to_app(error, status));
        }
    }

    let completion_tokens = count_token_text(&claude_response.completion, model);
    let mut full_response = claude::response_to_openai(&claude_response);
    full_response.usage = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    };
    let json_response = serde_json::to_vec(&full_response).map_err(|err| {
        AppError::wrap(
            "marshal_response_body_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err,
        )
    })?;

    settlement
        .settle(SettleOutcome::Buffered {
            usage: full_response.usage,
        })
        .await;

    let mut response = Response::new(Body::from(json_response));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

/// Copies the first value of every upstream header onto the downstream
/// response. Multi-valued headers keep only their first value.
fn copy_first_header_values(
    upstream_headers: &axum::http::HeaderMap,
    downstream_headers: &mut axum::http::HeaderMap,
) {
    for name in upstream_headers.keys() {
        if let Some(value) = upstream_headers.get(name) {
            downstream_headers.insert(name.clone(), value.clone());
        }
    }
}
