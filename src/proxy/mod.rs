//! Reverse proxy in front of the upstream API.
//!
//! Endpoints:
//! - GET /health - Health check
//! - ANY /api/v1/{path} - Forwarded to `{base_url}/{path}` with key rotation

mod handlers;

use axum::{
    http::HeaderMap,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::{Config, EndpointsConfig};
use crate::error::ProxyError;
use crate::forward::Forwarder;
use crate::http::{create_upstream_client, ClientError};
use crate::keys::{KeyPool, KeyPoolError};

/// Request-independent settings the handlers need.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub access_key: String,
    pub base_url: String,
    pub endpoints: EndpointsConfig,
    pub free_only: bool,
    pub vendor_quota_delay: Duration,
}

impl From<&Config> for ProxySettings {
    fn from(config: &Config) -> Self {
        Self {
            access_key: config.server.access_key.clone(),
            base_url: config.upstream.base_url.clone(),
            endpoints: config.endpoints.clone(),
            free_only: config.upstream.free_only,
            vendor_quota_delay: Duration::from_secs(config.upstream.vendor_quota_delay_secs),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<KeyPool>,
    pub forwarder: Forwarder,
    pub settings: Arc<ProxySettings>,
}

impl AppState {
    pub fn new(pool: KeyPool, forwarder: Forwarder, settings: ProxySettings) -> Self {
        Self {
            pool: Arc::new(pool),
            forwarder,
            settings: Arc::new(settings),
        }
    }

    /// Build the key pool, outbound client and settings from configuration.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let pool = KeyPool::new(config.keys.keys.clone(), config.keys.cooldown())
            .map_err(StartupError::Keys)?
            .with_strategy(config.keys.strategy)
            .with_sticky(config.keys.sticky);
        let client = create_upstream_client(&config.upstream).map_err(StartupError::Client)?;
        let forwarder = Forwarder::new(client, config.upstream.read_timeout());

        Ok(Self::new(pool, forwarder, ProxySettings::from(config)))
    }
}

#[derive(Debug)]
pub enum StartupError {
    Keys(KeyPoolError),
    Client(ClientError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keys(e) => write!(f, "Key pool error: {}", e),
            Self::Client(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StartupError {}

/// Check `Authorization: Bearer <access_key>`.
pub fn verify_access_key(headers: &HeaderMap, access_key: &str) -> Result<(), ProxyError> {
    let Some(authorization) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(ProxyError::Unauthorized("Authorization header missing".to_string()));
    };

    let (scheme, token) = authorization.split_once(' ').unwrap_or((authorization, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ProxyError::Unauthorized("Invalid authentication scheme".to_string()));
    }
    if token != access_key {
        return Err(ProxyError::Unauthorized("Invalid access key".to_string()));
    }
    Ok(())
}

/// Create the proxy router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/{*path}", any(handlers::proxy_endpoint))
        .with_state(state)
        .layer(trace)
        .layer(cors)
}
