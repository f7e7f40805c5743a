//! Rate-limit detection across the upstream's error encodings.
//!
//! The same "this key is throttled" fact shows up as:
//! - the upstream error envelope with `error.metadata.headers["X-RateLimit-Reset"]`
//! - a 429 envelope whose `error.metadata.raw` carries a vendor `RESOURCE_EXHAUSTED` error
//! - a plain 429 envelope with no reset information at all
//! - an `X-RateLimit-Reset` response header
//!
//! Every entry point is fail-open: malformed input means "not detected".

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub const RATE_LIMIT_ERROR_CODE: i64 = 429;
pub const RATE_LIMIT_RESET_HEADER: &str = "X-RateLimit-Reset";

const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// Outcome of a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitSignal {
    pub detected: bool,
    /// Epoch milliseconds at which the limit lifts, when known.
    pub reset_at_ms: Option<i64>,
    /// Set when the signal came from a nested vendor quota error.
    pub vendor_quota: bool,
}

impl RateLimitSignal {
    pub const NONE: Self = Self {
        detected: false,
        reset_at_ms: None,
        vendor_quota: false,
    };

    pub fn limited(reset_at_ms: Option<i64>) -> Self {
        Self {
            detected: true,
            reset_at_ms,
            vendor_quota: false,
        }
    }

    fn vendor(reset_at_ms: Option<i64>) -> Self {
        Self {
            detected: true,
            reset_at_ms,
            vendor_quota: true,
        }
    }

    /// Fill in a missing reset time from another source.
    pub fn or_reset(mut self, reset_at_ms: Option<i64>) -> Self {
        if self.reset_at_ms.is_none() {
            self.reset_at_ms = reset_at_ms;
        }
        self
    }
}

/// Inspect a buffered JSON response body.
pub fn detect_from_body(body: &[u8]) -> RateLimitSignal {
    detect_from_body_at(body, Utc::now())
}

/// Like [`detect_from_body`], resolving relative retry delays against `now`.
pub fn detect_from_body_at(body: &[u8], now: DateTime<Utc>) -> RateLimitSignal {
    match serde_json::from_slice::<Value>(body) {
        Ok(doc) => detect_from_value(&doc, now),
        Err(e) => {
            tracing::debug!("Response body is not JSON, skipping rate limit check: {}", e);
            RateLimitSignal::NONE
        }
    }
}

/// Inspect the payload carried after an SSE `data:` field.
pub fn detect_from_sse_payload(payload: &str) -> RateLimitSignal {
    detect_from_sse_payload_at(payload, Utc::now())
}

pub fn detect_from_sse_payload_at(payload: &str, now: DateTime<Utc>) -> RateLimitSignal {
    let payload = payload.trim();
    if payload == crate::sse::DONE_MARKER {
        return RateLimitSignal::NONE;
    }
    detect_from_body_at(payload.as_bytes(), now)
}

/// Read the `X-RateLimit-Reset` response header as epoch milliseconds.
pub fn detect_from_headers(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(RATE_LIMIT_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

fn detect_from_value(doc: &Value, now: DateTime<Utc>) -> RateLimitSignal {
    let Some(error) = doc.get("error").filter(|e| e.is_object()) else {
        return RateLimitSignal::NONE;
    };

    if let Some(reset) = metadata_reset(error) {
        return RateLimitSignal::limited(Some(reset));
    }

    if error_code(error) != Some(RATE_LIMIT_ERROR_CODE) {
        return RateLimitSignal::NONE;
    }

    if let Some(vendor) = vendor_quota_error(error) {
        let reset = vendor_retry_delay_ms(&vendor).and_then(|delay| now.timestamp_millis().checked_add(delay));
        tracing::info!(
            "Vendor returned {}, retry delay resolved to {:?}",
            RESOURCE_EXHAUSTED,
            reset
        );
        return RateLimitSignal::vendor(reset);
    }

    let message = error.get("message").and_then(Value::as_str).unwrap_or("");
    tracing::debug!("Rate limit error without reset time: {}", message);
    RateLimitSignal::limited(None)
}

/// `error.code` as an integer; some upstreams send it as a string.
fn error_code(error: &Value) -> Option<i64> {
    match error.get("code")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `error.metadata.headers["X-RateLimit-Reset"]`, matched case-insensitively.
fn metadata_reset(error: &Value) -> Option<i64> {
    let headers = error.get("metadata")?.get("headers")?.as_object()?;
    let value = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(RATE_LIMIT_RESET_HEADER))
        .map(|(_, v)| v)?;

    let reset = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;

    (reset > 0).then_some(reset)
}

/// The nested vendor error carried as a JSON string in `error.metadata.raw`,
/// returned only when it reports `RESOURCE_EXHAUSTED`.
fn vendor_quota_error(error: &Value) -> Option<Value> {
    let raw = error.get("metadata")?.get("raw")?.as_str()?;
    let nested: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("metadata.raw is not JSON: {}", e);
            return None;
        }
    };
    let inner = nested.get("error")?;
    (inner.get("status").and_then(Value::as_str) == Some(RESOURCE_EXHAUSTED)).then(|| inner.clone())
}

fn vendor_retry_delay_ms(vendor: &Value) -> Option<i64> {
    vendor
        .get("details")?
        .as_array()?
        .iter()
        .find(|item| item.get("@type").and_then(Value::as_str) == Some(RETRY_INFO_TYPE))
        .and_then(|item| item.get("retryDelay"))
        .and_then(Value::as_str)
        .and_then(parse_retry_delay)
}

/// Parse `<digits><unit>` with unit in s/m/h into milliseconds.
/// A fractional part on the number is accepted and truncated.
pub fn parse_retry_delay(delay: &str) -> Option<i64> {
    static DELAY_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\d+)(?:\.\d+)?([smh])$").unwrap());

    let caps = DELAY_REGEX.captures(delay.trim())?;
    let amount: i64 = caps[1].parse().ok()?;
    let unit_ms = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    amount.checked_mul(unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn detect(doc: Value) -> RateLimitSignal {
        detect_from_body_at(doc.to_string().as_bytes(), now())
    }

    fn vendor_envelope(details: Value) -> Value {
        let raw = json!({
            "error": {
                "code": 429,
                "message": "You exceeded your current quota",
                "status": "RESOURCE_EXHAUSTED",
                "details": details
            }
        });
        json!({
            "error": {
                "code": 429,
                "message": "Provider returned error",
                "metadata": {"raw": raw.to_string(), "provider_name": "Google AI Studio"}
            }
        })
    }

    #[test]
    fn reads_reset_from_metadata_headers() {
        let signal = detect(json!({
            "error": {"code": 429, "metadata": {"headers": {"X-RateLimit-Reset": "1700000000000"}}}
        }));

        assert_eq!(signal, RateLimitSignal::limited(Some(1_700_000_000_000)));
    }

    #[test]
    fn bare_429_is_detected_without_reset() {
        let signal = detect(json!({
            "error": {"code": 429, "message": "Rate limit exceeded: free-models-per-day"}
        }));

        assert_eq!(signal, RateLimitSignal::limited(None));
    }

    #[test]
    fn string_error_code_is_accepted() {
        let signal = detect(json!({"error": {"code": "429", "message": "slow down"}}));
        assert!(signal.detected);
    }

    #[test]
    fn success_body_is_not_detected() {
        let signal = detect(json!({"id": "gen-1", "choices": [{"message": {"content": "hi"}}]}));
        assert_eq!(signal, RateLimitSignal::NONE);
    }

    #[test]
    fn non_json_is_not_detected() {
        assert_eq!(detect_from_body(b"<html>Bad Gateway</html>"), RateLimitSignal::NONE);
        assert_eq!(detect_from_body(b""), RateLimitSignal::NONE);
    }

    #[test]
    fn ordinary_errors_are_not_detected() {
        for code in [400, 401, 402, 500, 502] {
            let signal = detect(json!({"error": {"code": code, "message": "nope"}}));
            assert!(!signal.detected, "code {} must not be treated as a rate limit", code);
        }
    }

    #[test]
    fn error_that_is_not_an_object_is_ignored() {
        assert!(!detect(json!({"error": "rate limited"})).detected);
    }

    #[test]
    fn unparsable_metadata_reset_falls_back_to_code() {
        let signal = detect(json!({
            "error": {"code": 429, "metadata": {"headers": {"X-RateLimit-Reset": "soon"}}}
        }));
        assert_eq!(signal, RateLimitSignal::limited(None));

        let signal = detect(json!({
            "error": {"code": 500, "metadata": {"headers": {"X-RateLimit-Reset": "soon"}}}
        }));
        assert_eq!(signal, RateLimitSignal::NONE);
    }

    #[test]
    fn vendor_quota_with_retry_info_synthesizes_reset() {
        let signal = detect(vendor_envelope(json!([
            {"@type": "type.googleapis.com/google.rpc.QuotaFailure", "violations": []},
            {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "5s"}
        ])));

        assert!(signal.detected);
        assert!(signal.vendor_quota);
        assert_eq!(signal.reset_at_ms, Some(now().timestamp_millis() + 5_000));
    }

    #[test]
    fn vendor_quota_without_retry_info_has_no_reset() {
        let signal = detect(vendor_envelope(json!([
            {"@type": "type.googleapis.com/google.rpc.Help", "links": []}
        ])));

        assert!(signal.detected);
        assert!(signal.vendor_quota);
        assert_eq!(signal.reset_at_ms, None);
    }

    #[test]
    fn unrelated_raw_payload_falls_back_to_code_detection() {
        let signal = detect(json!({
            "error": {"code": 429, "metadata": {"raw": "upstream overloaded"}}
        }));

        assert_eq!(signal, RateLimitSignal::limited(None));
    }

    #[test]
    fn parses_retry_delay_units() {
        assert_eq!(parse_retry_delay("5s"), Some(5_000));
        assert_eq!(parse_retry_delay("2m"), Some(120_000));
        assert_eq!(parse_retry_delay("1h"), Some(3_600_000));
        assert_eq!(parse_retry_delay("17.25s"), Some(17_000));
        assert_eq!(parse_retry_delay("5d"), None);
        assert_eq!(parse_retry_delay("s"), None);
        assert_eq!(parse_retry_delay(""), None);
    }

    #[test]
    fn huge_vendor_retry_delay_keeps_detection_without_reset() {
        let signal = detect(vendor_envelope(json!([
            {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "9223372036854775s"}
        ])));

        assert!(signal.detected);
        assert!(signal.vendor_quota);
        assert_eq!(signal.reset_at_ms, None);
    }

    #[test]
    fn sse_payload_uses_body_rules() {
        let payload = r#"{"error":{"code":429,"metadata":{"headers":{"X-RateLimit-Reset":"1700000060000"}}}}"#;
        assert_eq!(
            detect_from_sse_payload(payload),
            RateLimitSignal::limited(Some(1_700_000_060_000))
        );
    }

    #[test]
    fn sse_done_marker_is_never_evaluated() {
        assert_eq!(detect_from_sse_payload("[DONE]"), RateLimitSignal::NONE);
    }

    #[test]
    fn reads_reset_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(detect_from_headers(&headers), None);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000000"));
        assert_eq!(detect_from_headers(&headers), Some(1_700_000_000_000));

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("later"));
        assert_eq!(detect_from_headers(&headers), None);
    }

    #[test]
    fn or_reset_only_fills_missing_values() {
        assert_eq!(
            RateLimitSignal::limited(None).or_reset(Some(7)).reset_at_ms,
            Some(7)
        );
        assert_eq!(
            RateLimitSignal::limited(Some(3)).or_reset(Some(7)).reset_at_ms,
            Some(3)
        );
    }
}
