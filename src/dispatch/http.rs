use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::{Client, Response};

use crate::dispatch::registry::BackendConfig;
use crate::dispatch::{StreamEvent, TextStream, WireApi, WireRequest};
use crate::error::QuillError;

pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024; // 8MB

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall ceiling for a streaming request. Slow providers under load can
/// take tens of minutes to finish a long chapter.
pub const STREAM_CEILING: Duration = Duration::from_secs(30 * 60);

/// Build the one client an adapter owns. An explicit proxy is used for all
/// schemes; without one, environment proxies are ignored.
pub fn build_client(config: &BackendConfig) -> Result<Client, QuillError> {
    let mut builder = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4);

    builder = match config.proxy.as_deref().map(str::trim) {
        Some(proxy) if !proxy.is_empty() => {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                QuillError::Configuration(format!("invalid proxy for {}: {e}", config.name))
            })?;
            builder.proxy(proxy)
        }
        _ => builder.no_proxy(),
    };

    builder.build().map_err(|e| {
        QuillError::Configuration(format!("failed to build HTTP client for {}: {e}", config.name))
    })
}

/// Send a request and map non-success statuses onto the error taxonomy.
pub async fn send(
    client: &Client,
    req: &WireRequest,
    timeout: Duration,
    provider: &str,
) -> Result<Response, QuillError> {
    let mut builder = match &req.body {
        Some(body) => client.post(&req.url).json(body),
        None => client.get(&req.url),
    };
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }

    let response = builder.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            QuillError::Timeout(timeout.as_millis() as u64)
        } else {
            QuillError::Request(e)
        }
    })?;

    check_status(response, provider).await
}

async fn check_status(response: Response, provider: &str) -> Result<Response, QuillError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(QuillError::RateLimited {
            provider: provider.to_string(),
        });
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(QuillError::AuthFailed {
            provider: provider.to_string(),
            message: format!("{status}"),
        });
    }

    // Catch-all for any non-success status (4xx, 5xx, 3xx that wasn't followed).
    // Cap error body reads to MAX_RESPONSE_BYTES to prevent memory exhaustion.
    if !status.is_success() {
        let error_bytes = response.bytes().await.unwrap_or_default();
        let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
        let text = String::from_utf8_lossy(truncated);
        return Err(QuillError::Upstream {
            provider: provider.to_string(),
            message: format!("{status}: {text}"),
            status: Some(status.as_u16()),
        });
    }

    Ok(response)
}

/// Read a full response body, rejecting bodies over MAX_RESPONSE_BYTES.
pub async fn read_body(response: Response, provider: &str) -> Result<Vec<u8>, QuillError> {
    if let Some(len) = response.content_length()
        && len as usize > MAX_RESPONSE_BYTES
    {
        return Err(too_large(provider, len as usize));
    }

    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                QuillError::Timeout(0)
            } else {
                QuillError::Upstream {
                    provider: provider.to_string(),
                    message: format!("failed to read response body: {e}"),
                    status: None,
                }
            }
        })?;
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(too_large(provider, body.len() + chunk.len()));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn too_large(provider: &str, size: usize) -> QuillError {
    QuillError::Upstream {
        provider: provider.to_string(),
        message: format!("response too large: {size} bytes (max {MAX_RESPONSE_BYTES})"),
        status: None,
    }
}

struct SseState {
    events: BoxStream<'static, Result<Event, EventStreamError<reqwest::Error>>>,
    api: Arc<dyn WireApi>,
    stall: Duration,
    finished: bool,
}

/// Turn an SSE response into a stream of non-blank text fragments.
///
/// Transport failures, provider error events and stalls longer than `stall`
/// are yielded once as `Err` and end the stream. Dropping the stream drops
/// the response and releases its connection.
pub fn sse_text_stream(response: Response, api: Arc<dyn WireApi>, stall: Duration) -> TextStream {
    let state = SseState {
        events: response.bytes_stream().eventsource().boxed(),
        api,
        stall,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let event = match tokio::time::timeout(state.stall, state.events.next()).await {
                Err(_) => {
                    state.finished = true;
                    let err = QuillError::Timeout(state.stall.as_millis() as u64);
                    return Some((Err(err), state));
                }
                Ok(None) => return None,
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    let err = transport_error(state.api.provider(), e);
                    return Some((Err(err), state));
                }
                Ok(Some(Ok(event))) => event,
            };

            match state.api.parse_stream_event(&event.event, &event.data) {
                Ok(StreamEvent::Delta(Some(text))) if !text.trim().is_empty() => {
                    return Some((Ok(text), state));
                }
                Ok(StreamEvent::Delta(_)) | Ok(StreamEvent::Skip) => continue,
                Ok(StreamEvent::Done) => return None,
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
    .fuse()
    .boxed()
}

fn transport_error(provider: &str, err: EventStreamError<reqwest::Error>) -> QuillError {
    match err {
        EventStreamError::Transport(e) if e.is_timeout() => QuillError::Timeout(0),
        other => QuillError::Stream {
            provider: provider.to_string(),
            message: other.to_string(),
        },
    }
}
