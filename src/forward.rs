//! Outbound request construction and dispatch.

use crate::config::EndpointsConfig;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use std::time::Duration;

/// Request headers never copied to the upstream. The outbound client
/// negotiates `accept-encoding` itself and decodes the body.
const STRIPPED_REQUEST_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::AUTHORIZATION,
    header::ACCEPT_ENCODING,
];

/// Response headers dropped before relaying: the body is already decoded and re-framed.
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Per-request flags derived from the configured path-prefix lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointClass {
    /// No local auth and no upstream key.
    pub public: bool,
    /// Response passes through untouched.
    pub binary: bool,
    /// May answer with an event stream.
    pub completion: bool,
    /// Model listing, subject to free-only shaping.
    pub models: bool,
}

impl EndpointClass {
    pub fn classify(full_path: &str, endpoints: &EndpointsConfig) -> Self {
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| full_path.starts_with(p.as_str()));
        Self {
            public: matches(&endpoints.public),
            binary: matches(&endpoints.binary),
            completion: matches(&endpoints.completion),
            models: matches(&endpoints.models),
        }
    }
}

/// The parts of an inbound request needed to (re)build upstream calls.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Whether a completion call asked for a streamed answer (`"stream": true`).
    pub fn wants_stream(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|body| body.get("stream").and_then(|s| s.as_bool()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    /// Build the upstream call for `path` (relative to `base_url`), injecting
    /// `Authorization: Bearer <api_key>` only when a key is given.
    pub fn build(inbound: &InboundRequest, base_url: &str, path: &str, api_key: Option<&str>) -> Self {
        let mut url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        if let Some(query) = inbound.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let mut headers = inbound.headers.clone();
        for name in &STRIPPED_REQUEST_HEADERS {
            headers.remove(name);
        }
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            if let Ok(value) = format!("Bearer {}", key).parse() {
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        Self {
            method: inbound.method.clone(),
            url,
            headers,
            body: inbound.body.clone(),
        }
    }
}

/// Shape of an upstream response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Binary,
    BufferedJson,
    EventStream,
}

impl ContentKind {
    pub fn classify(headers: &HeaderMap, binary_endpoint: bool) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("text/event-stream") {
            Self::EventStream
        } else if binary_endpoint
            || content_type.contains("application/octet-stream")
            || content_type.contains("image/")
        {
            Self::Binary
        } else {
            Self::BufferedJson
        }
    }
}

#[derive(Debug)]
pub enum ForwardError {
    Connect(String),
    Timeout(String),
    Other(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect error: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Other(msg) => write!(f, "request failed: {}", msg),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<reqwest::Error> for ForwardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// An upstream response with relay-safe headers and an unread body.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    inner: reqwest::Response,
}

impl UpstreamResponse {
    pub fn kind(&self, binary_endpoint: bool) -> ContentKind {
        ContentKind::classify(&self.headers, binary_endpoint)
    }

    /// Drain the whole body.
    pub async fn bytes(self) -> Result<Bytes, ForwardError> {
        Ok(self.inner.bytes().await?)
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, reqwest::Error>> {
        self.inner.bytes_stream().boxed()
    }
}

/// Sends upstream requests over the shared client.
#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    read_timeout: Duration,
}

impl Forwarder {
    pub fn new(client: Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    /// Send `request`. Buffered calls are bounded by the read timeout;
    /// streaming calls are not.
    pub async fn send(&self, request: &UpstreamRequest, streaming: bool) -> Result<UpstreamResponse, ForwardError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone());
        if !streaming {
            builder = builder.timeout(self.read_timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let mut headers = response.headers().clone();
        for name in &STRIPPED_RESPONSE_HEADERS {
            headers.remove(name);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            inner: response,
        })
    }
}
