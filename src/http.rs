//! Shared outbound HTTP client factory.
//!
//! One client is built at startup and reused for every upstream call. It has
//! no overall request timeout: buffered calls set a per-request timeout, while
//! streaming calls may run as long as the model keeps generating.

use crate::config::UpstreamConfig;
use reqwest::Client;
use std::time::Duration;

/// Default connect timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ClientError(String);

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to create HTTP client: {}", self.0)
    }
}

impl std::error::Error for ClientError {}

/// Create a client with the default connect timeout and no outbound proxy.
#[cfg(test)]
pub fn create_client() -> Result<Client, ClientError> {
    build_client(DEFAULT_CONNECT_TIMEOUT, None)
}

/// Create the upstream client described by `config`.
pub fn create_upstream_client(config: &UpstreamConfig) -> Result<Client, ClientError> {
    build_client(config.connect_timeout(), config.proxy_url())
}

fn build_client(connect_timeout: Duration, proxy_url: Option<&str>) -> Result<Client, ClientError> {
    let mut builder = Client::builder().connect_timeout(connect_timeout);

    builder = match proxy_url {
        Some(url) => {
            tracing::info!("Routing upstream traffic through proxy {}", url);
            let proxy = reqwest::Proxy::all(url).map_err(|e| ClientError(e.to_string()))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder.build().map_err(|e| ClientError(e.to_string()))
}
