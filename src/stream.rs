//! Streaming passthrough. One producer task per request reads the upstream
//! body through a framing scanner, forwards frames into a bounded channel,
//! and captures response text for post-hoc token counting; the downstream
//! response body drains the channel. A dropped receiver (client
//! disconnect) fails the send and stops the upstream read, and settlement
//! runs when the pump finishes on every path.

use crate::claude::{self, ClaudeResponse};
use crate::context::RelayMode;
use crate::openai::{ChatCompletionsStreamResponse, CompletionsStreamResponse};
use crate::quota::{SettleOutcome, Settlement};
use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Incremental newline-delimited scanner for the OpenAI SSE framing. Each
/// complete line is one frame; a partial line is held until more bytes (or
/// EOF) arrive.
#[derive(Debug, Default)]
pub struct LineScanner {
    buffer: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            frames.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        frames
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Incremental blank-line-delimited scanner for the Claude SSE framing.
/// Frames are separated by `\r\n\r\n`; each frame still carries its
/// `event:` header line.
#[derive(Debug, Default)]
pub struct BlockScanner {
    buffer: Vec<u8>,
}

const BLOCK_SEPARATOR: &[u8] = b"\r\n\r\n";

impl BlockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self
            .buffer
            .windows(BLOCK_SEPARATOR.len())
            .position(|window| window == BLOCK_SEPARATOR)
        {
            let block: Vec<u8> = self.buffer.drain(..pos + BLOCK_SEPARATOR.len()).collect();
            frames.push(String::from_utf8_lossy(&block[..pos]).into_owned());
        }
        frames
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn event_stream_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    use axum::http::HeaderValue;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
    );
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response
}

/// Parses one forwarded OpenAI frame for accounting. Garbled frames are
/// logged and skipped; forwarding is never interrupted by a parse failure.
fn accumulate_openai_frame(frame: &str, mode: RelayMode, acc: &mut String) {
    let Some(data) = frame.get(6..) else {
        return;
    };
    if data.starts_with("[DONE]") {
        return;
    }
    match mode {
        RelayMode::ChatCompletions => {
            match serde_json::from_str::<ChatCompletionsStreamResponse>(data) {
                Ok(parsed) => {
                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            acc.push_str(&content);
                        }
                    }
                }
                Err(err) => tracing::warn!("error unmarshalling stream response: {err}"),
            }
        }
        RelayMode::Completions => match serde_json::from_str::<CompletionsStreamResponse>(data) {
            Ok(parsed) => {
                for choice in parsed.choices {
                    acc.push_str(&choice.text);
                }
            }
            Err(err) => tracing::warn!("error unmarshalling stream response: {err}"),
        },
        _ => {}
    }
}

fn normalize_openai_frame(mut frame: String) -> Option<String> {
    // Under 6 bytes is a keepalive blank or a stray fragment.
    if frame.len() < 6 {
        return None;
    }
    if frame.starts_with("data: [DONE]") {
        frame.truncate(12);
    }
    // Some upstreams terminate frames with \r\n.
    if frame.ends_with('\r') {
        frame.pop();
    }
    Some(frame)
}

/// Relays an OpenAI-framed event stream downstream verbatim while
/// accumulating response text, then settles.
pub fn relay_openai_stream(
    upstream: reqwest::Response,
    mode: RelayMode,
    settlement: Settlement,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(async move {
        let mut scanner = LineScanner::new();
        let mut acc = String::new();
        let mut upstream_body = upstream.bytes_stream();
        'read: loop {
            let frames = match upstream_body.next().await {
                Some(Ok(chunk)) => scanner.push(&chunk),
                Some(Err(err)) => {
                    tracing::warn!("error reading upstream stream: {err}");
                    break;
                }
                None => break,
            };
            for frame in frames {
                let Some(frame) = normalize_openai_frame(frame) else {
                    continue;
                };
                accumulate_openai_frame(&frame, mode, &mut acc);
                if tx.send(Bytes::from(format!("{frame}\n\n"))).await.is_err() {
                    // Client went away; stop draining upstream.
                    break 'read;
                }
            }
        }
        if let Some(frame) = scanner.finish() {
            if let Some(frame) = normalize_openai_frame(frame) {
                accumulate_openai_frame(&frame, mode, &mut acc);
                let _ = tx.send(Bytes::from(format!("{frame}\n\n"))).await;
            }
        }
        drop(tx);
        settlement.settle(SettleOutcome::Streamed { text: acc }).await;
    });
    event_stream_response(rx)
}

const COMPLETION_EVENT_PREFIX: &str = "event: completion";
const COMPLETION_DATA_PREFIX: &str = "event: completion\r\ndata: ";

/// Relays a Claude-framed event stream, translating every `completion`
/// event into a `chat.completion.chunk` stamped with one stable id and
/// timestamp, and terminating the downstream with `data: [DONE]`.
pub fn relay_claude_stream(upstream: reqwest::Response, settlement: Settlement) -> Response {
    let response_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(async move {
        let mut scanner = BlockScanner::new();
        let mut acc = String::new();
        let mut upstream_body = upstream.bytes_stream();
        'read: loop {
            let frames = match upstream_body.next().await {
                Some(Ok(chunk)) => scanner.push(&chunk),
                Some(Err(err)) => {
                    tracing::warn!("error reading upstream stream: {err}");
                    break;
                }
                None => break,
            };
            for frame in frames {
                let Some(chunk) =
                    translate_claude_frame(&frame, &response_id, created, &mut acc)
                else {
                    continue;
                };
                if tx.send(Bytes::from(format!("data: {chunk}\n\n"))).await.is_err() {
                    break 'read;
                }
            }
        }
        if let Some(frame) = scanner.finish() {
            if let Some(chunk) = translate_claude_frame(&frame, &response_id, created, &mut acc) {
                let _ = tx.send(Bytes::from(format!("data: {chunk}\n\n"))).await;
            }
        }
        let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
        drop(tx);
        settlement.settle(SettleOutcome::Streamed { text: acc }).await;
    });
    event_stream_response(rx)
}

/// Filters, parses, accumulates, and translates one Claude event block.
/// Returns the serialized downstream chunk, or `None` when the block is
/// not a completion event or does not parse (accounting degrades, the
/// stream keeps going).
fn translate_claude_frame(
    frame: &str,
    response_id: &str,
    created: i64,
    acc: &mut String,
) -> Option<String> {
    if !frame.starts_with(COMPLETION_EVENT_PREFIX) {
        return None;
    }
    let mut data = frame.strip_prefix(COMPLETION_DATA_PREFIX).unwrap_or(frame);
    data = data.strip_suffix('\r').unwrap_or(data);
    let claude_response: ClaudeResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("error unmarshalling stream response: {err}");
            return None;
        }
    };
    acc.push_str(&claude_response.completion);
    let chunk = claude::stream_response_to_openai(&claude_response, response_id, created);
    match serde_json::to_string(&chunk) {
        Ok(json) => Some(json),
        Err(err) => {
            tracing::warn!("error marshalling stream response: {err}");
            None
        }
    }
}
