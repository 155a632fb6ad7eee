//! Outbound dispatch: body selection, per-dialect auth rewriting, and the
//! single upstream HTTP exchange.

use crate::claude;
use crate::context::{ApiType, ChannelType, RequestContext};
use crate::error::{AppError, AppResult};
use crate::plan::RelayPlan;
use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;

/// Picks the bytes to send upstream: the adapter's Claude request for the
/// Claude dialect, the re-serialized canonical request when the model was
/// remapped, otherwise the caller's bytes untouched.
pub fn build_upstream_body(plan: &RelayPlan, raw_body: &Bytes) -> AppResult<Bytes> {
    if plan.api_type == ApiType::Claude {
        let claude_request = claude::request_from_openai(&plan.text_request);
        let body = serde_json::to_vec(&claude_request).map_err(|err| {
            AppError::wrap(
                "marshal_text_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err,
            )
        })?;
        return Ok(Bytes::from(body));
    }
    if plan.is_model_mapped {
        let body = serde_json::to_vec(&plan.text_request).map_err(|err| {
            AppError::wrap(
                "marshal_text_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err,
            )
        })?;
        return Ok(Bytes::from(body));
    }
    Ok(raw_body.clone())
}

/// Sends the planned request upstream, echoing the caller's method and
/// rewriting auth for the target dialect. The caller's `Authorization`
/// value at this point is the channel credential installed by the
/// distribution middleware.
pub async fn dispatch(
    http: &reqwest::Client,
    ctx: &RequestContext,
    plan: &RelayPlan,
    method: Method,
    inbound_headers: &HeaderMap,
    body: Bytes,
) -> AppResult<reqwest::Response> {
    let url = reqwest::Url::parse(&plan.upstream_url).map_err(|err| {
        AppError::wrap("new_request_failed", StatusCode::INTERNAL_SERVER_ERROR, err)
    })?;

    let authorization = inbound_headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = authorization.trim_start_matches("Bearer ");

    let mut request = http.request(method, url).body(body);
    match plan.api_type {
        ApiType::OpenAI => {
            if ctx.channel_type == ChannelType::Azure {
                request = request.header("api-key", api_key);
            } else {
                request = request.header(header::AUTHORIZATION, authorization);
            }
        }
        ApiType::Claude => {
            let anthropic_version = inbound_headers
                .get("anthropic-version")
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .unwrap_or(claude::DEFAULT_ANTHROPIC_VERSION);
            request = request
                .header("x-api-key", api_key)
                .header("anthropic-version", anthropic_version);
        }
        ApiType::PaLM => {
            return Err(AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unknown_api_type",
                "unknown api type",
            ));
        }
    }
    for name in [header::CONTENT_TYPE, header::ACCEPT] {
        if let Some(value) = inbound_headers.get(&name) {
            request = request.header(name, value.clone());
        }
    }

    request
        .send()
        .await
        .map_err(|err| AppError::wrap("do_request_failed", StatusCode::INTERNAL_SERVER_ERROR, err))
}
