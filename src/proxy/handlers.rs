//! HTTP handlers for the proxy.

use super::{verify_access_key, AppState};
use crate::config::API_PREFIX;
use crate::detect::{detect_from_body, detect_from_headers, detect_from_sse_payload, RateLimitSignal};
use crate::error::ProxyError;
use crate::filter::filter_free_models;
use crate::forward::{ContentKind, EndpointClass, InboundRequest, UpstreamRequest, UpstreamResponse};
use crate::keys::{mask_key, KeyPool};
use crate::sse::{self, StreamEnd};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Forward `/api/v1/{path}` upstream, rotating keys around rate limits.
pub async fn proxy_endpoint(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ProxyError> {
    // Raw path, so percent-encoded segments reach the upstream unchanged.
    let full_path = request.uri().path().to_string();
    let path = upstream_path(&full_path).to_string();
    let class = EndpointClass::classify(&full_path, &state.settings.endpoints);

    if !class.public {
        verify_access_key(request.headers(), &state.settings.access_key)?;
    }

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Internal(format!("Failed to read request body: {}", e)))?;
    let inbound = InboundRequest {
        method: parts.method,
        headers: parts.headers,
        query: parts.uri.query().map(String::from),
        body,
    };
    let streaming = class.completion && inbound.wants_stream();

    let request_id = Uuid::new_v4();
    tracing::info!(
        request_id = %request_id,
        method = %inbound.method,
        path = %full_path,
        public = class.public,
        binary = class.binary,
        streaming,
        "Proxying request"
    );

    let call = Call {
        state: &state,
        inbound: &inbound,
        path: &path,
        class,
        streaming,
    };

    let api_key = if class.public { None } else { Some(state.pool.next()?) };
    let attempt = call.attempt(api_key.as_deref()).await?;

    match (attempt, api_key) {
        (Attempt::Buffered(first), Some(key)) if first.signal.detected => {
            tracing::warn!(
                request_id = %request_id,
                "Rate limit hit for key {}, disabling and retrying",
                mask_key(&key)
            );
            state.pool.disable(&key, first.signal.reset_at_ms);
            call.retry(first.signal).await
        }
        (attempt, api_key) => Ok(call.respond(attempt, api_key)),
    }
}

/// A fully received upstream answer that has not reached the client yet.
struct Buffered {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    signal: RateLimitSignal,
}

enum Attempt {
    Buffered(Buffered),
    EventStream(UpstreamResponse),
    Binary(UpstreamResponse),
}

/// One inbound request being served, possibly over two upstream calls.
struct Call<'a> {
    state: &'a AppState,
    inbound: &'a InboundRequest,
    path: &'a str,
    class: EndpointClass,
    streaming: bool,
}

impl Call<'_> {
    async fn attempt(&self, api_key: Option<&str>) -> Result<Attempt, ProxyError> {
        let settings = &self.state.settings;
        let request = UpstreamRequest::build(self.inbound, &settings.base_url, self.path, api_key);
        let upstream = self.state.forwarder.send(&request, self.streaming).await?;

        match upstream.kind(self.class.binary) {
            ContentKind::Binary => {
                self.log_binary_status(upstream.status);
                Ok(Attempt::Binary(upstream))
            }
            ContentKind::EventStream if upstream.status.as_u16() < 400 => Ok(Attempt::EventStream(upstream)),
            // Error bodies are drained in full before anything reaches the client.
            _ => self.buffer(upstream).await.map(Attempt::Buffered),
        }
    }

    async fn buffer(&self, upstream: UpstreamResponse) -> Result<Buffered, ProxyError> {
        let status = upstream.status;
        let headers = upstream.headers.clone();
        let body = upstream.bytes().await?;

        let header_reset = detect_from_headers(&headers);
        let mut signal = detect_from_body(&body).or_reset(header_reset);
        if !signal.detected && status == StatusCode::TOO_MANY_REQUESTS && header_reset.is_some() {
            signal = RateLimitSignal::limited(header_reset);
        }

        if status.is_client_error() || status.is_server_error() {
            tracing::debug!("Upstream returned {}: {}", status, String::from_utf8_lossy(&body));
        }

        let settings = &self.state.settings;
        let body = if self.class.models && settings.free_only && status.is_success() {
            filter_free_models(&body).unwrap_or(body)
        } else {
            body
        };

        Ok(Buffered {
            status,
            headers,
            body,
            signal,
        })
    }

    /// Second and final attempt with a fresh key.
    async fn retry(&self, signal: RateLimitSignal) -> Result<Response, ProxyError> {
        let delay = self.state.settings.vendor_quota_delay;
        if signal.vendor_quota && !delay.is_zero() {
            tracing::info!("Vendor quota exhausted, waiting {:?} before retrying", delay);
            tokio::time::sleep(delay).await;
        }

        let key = self.state.pool.next()?;
        let attempt = self.attempt(Some(&key)).await?;

        if let Attempt::Buffered(retried) = &attempt {
            if retried.signal.detected {
                tracing::warn!("Retry with key {} was rate limited too", mask_key(&key));
                self.state.pool.disable(&key, retried.signal.reset_at_ms);
            }
        }

        Ok(self.respond(attempt, Some(key)))
    }

    fn respond(&self, attempt: Attempt, api_key: Option<String>) -> Response {
        match attempt {
            Attempt::Buffered(buffered) => build_response(buffered.status, buffered.headers, Body::from(buffered.body)),
            Attempt::Binary(upstream) => {
                let status = upstream.status;
                let headers = upstream.headers.clone();
                build_response(status, headers, Body::from_stream(upstream.into_stream()))
            }
            Attempt::EventStream(upstream) => {
                let status = upstream.status;
                let headers = upstream.headers.clone();
                let pool = self.state.pool.clone();
                let body = sse::relay(upstream.into_stream(), move |end| {
                    check_stream_end(&pool, api_key.as_deref(), end)
                });
                build_response(status, headers, body)
            }
        }
    }

    fn log_binary_status(&self, status: StatusCode) {
        if status.is_success() {
            return;
        }
        if status == StatusCode::NOT_FOUND && self.path.starts_with("generation") {
            tracing::debug!("Generation stats not ready yet (404)");
        } else {
            tracing::error!("Upstream returned {} for binary endpoint {}", status, self.path);
        }
    }
}

/// A stream that ends with an error event has already been relayed; the
/// key is disabled so the next request avoids it.
fn check_stream_end(pool: &KeyPool, api_key: Option<&str>, end: StreamEnd) {
    let (Some(key), Some(payload)) = (api_key, end.last_payload) else {
        return;
    };

    let signal = detect_from_sse_payload(&payload);
    if signal.detected {
        tracing::warn!("Stream for key {} ended with a rate limit error", mask_key(key));
        pool.disable(key, signal.reset_at_ms);
    }
}

/// The part of an inbound path below the API prefix.
fn upstream_path(full_path: &str) -> &str {
    full_path
        .strip_prefix(API_PREFIX)
        .unwrap_or(full_path)
        .trim_start_matches('/')
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
