use std::net::SocketAddr;
use std::sync::Arc;

use async_stream::stream;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::filter::{Filter, FilterAction};
use crate::state::RequestStateStore;

/// Shared handler state: the immutable plugin config, the per-request
/// scratchpad, and the HTTP client used to reach the configured LLM upstream.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PluginConfig>,
    pub request_state: Arc<RequestStateStore>,
    pub http: reqwest::Client,
    pub upstream: String,
}

fn local_response(status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::CONFLICT);
    (status, "token budget exceeded").into_response()
}

/// Proxies `/v1/chat/completions` to the configured upstream, running the
/// filter's decode/encode phases around the forward. Stands in for the
/// gateway runtime that would otherwise own these phases in production.
pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let req_id = Uuid::new_v4().to_string();
    let filter = Filter::new(state.config.clone(), state.request_state.clone());
    let remote_ip = addr.ip().to_string();

    match filter
        .decode_request(&req_id, &headers, &uri, &remote_ip, &body)
        .await
    {
        FilterAction::LocalResponse(status) => return local_response(status),
        FilterAction::Continue => {}
    }

    let is_stream = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false);

    let upstream_url = format!("{}/v1/chat/completions", state.upstream);
    let upstream_resp = match state
        .http
        .post(&upstream_url)
        .header("content-type", "application/json")
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(error = %err, upstream_url, "upstream request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if !is_stream {
        let bytes = match upstream_resp.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "failed reading upstream response body");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        if let FilterAction::LocalResponse(status) = filter.encode_response(&req_id, &bytes).await
        {
            return local_response(status);
        }

        return (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response();
    }

    let mut upstream_stream = upstream_resp.bytes_stream();
    let sse_stream = stream! {
        'chunks: while let Some(chunk) = upstream_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::error!(error = %err, "error reading upstream stream chunk");
                    break;
                }
            };

            for line in chunk.split(|b| *b == b'\n') {
                let line = line.strip_prefix(b"data: ").unwrap_or(line);
                if line.is_empty() || line == b"[DONE]" {
                    continue;
                }

                if let FilterAction::LocalResponse(_) = filter.encode_data(&req_id, line).await {
                    tracing::warn!(req_id = %req_id, "token budget exceeded mid-stream, terminating early");
                    break 'chunks;
                }

                if let Ok(text) = std::str::from_utf8(line) {
                    yield Ok::<_, std::convert::Infallible>(SseEvent::default().data(text.to_string()));
                }
            }
        }
    };

    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}
