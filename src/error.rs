//! Error taxonomy for the proxy.
//!
//! Upstream status errors are not represented here: a non-2xx upstream
//! response is relayed to the client as-is.

use crate::forward::ForwardError;
use crate::keys::KeyPoolError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone)]
pub enum ProxyError {
    /// Missing or invalid local bearer token.
    Unauthorized(String),
    /// Every upstream key is cooling down.
    AllKeysDisabled { retry_after_secs: u64 },
    /// Upstream could not be reached.
    UpstreamConnect(String),
    /// Upstream did not answer in time.
    UpstreamTimeout(String),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(msg) => write!(f, "{}", msg),
            Self::AllKeysDisabled { .. } => write!(
                f,
                "All API keys are currently disabled due to rate limits. Please try again later."
            ),
            Self::UpstreamConnect(msg) => write!(f, "Upstream unreachable: {}", msg),
            Self::UpstreamTimeout(msg) => write!(f, "Upstream timed out: {}", msg),
            Self::Internal(msg) => write!(f, "Proxy error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::AllKeysDisabled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamConnect(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "authentication_error",
            Self::AllKeysDisabled { .. } => "all_keys_disabled",
            Self::UpstreamConnect(_) => "upstream_unreachable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<KeyPoolError> for ProxyError {
    fn from(err: KeyPoolError) -> Self {
        match err {
            KeyPoolError::AllKeysDisabled { retry_after, .. } => Self::AllKeysDisabled {
                // Round up so clients never retry a moment too early.
                retry_after_secs: retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0),
            },
            KeyPoolError::Empty => Self::Internal(err.to_string()),
        }
    }
}

impl From<ForwardError> for ProxyError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Connect(msg) => Self::UpstreamConnect(msg),
            ForwardError::Timeout(msg) => Self::UpstreamTimeout(msg),
            ForwardError::Other(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponseBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::AllKeysDisabled { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let Self::Unauthorized(_) = self {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn unauthorized_maps_to_401() {
        let err = ProxyError::Unauthorized("Invalid access key".to_string());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "Invalid access key");
    }

    #[test]
    fn all_keys_disabled_sets_retry_after() {
        let err: ProxyError = KeyPoolError::AllKeysDisabled {
            until: Utc::now(),
            retry_after: Duration::from_millis(2_500),
        }
        .into();

        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn forward_errors_map_to_gateway_statuses() {
        let connect: ProxyError = ForwardError::Connect("refused".to_string()).into();
        let timeout: ProxyError = ForwardError::Timeout("slow".to_string()).into();
        let other: ProxyError = ForwardError::Other("boom".to_string()).into();

        assert_eq!(connect.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(other.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn display_includes_context() {
        assert!(ProxyError::UpstreamConnect("refused".to_string())
            .to_string()
            .contains("refused"));
        assert!(ProxyError::Internal("boom".to_string())
            .to_string()
            .contains("boom"));
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ProxyError>();
    }
}
