//! OpenRouter Proxy - Local reverse proxy that rotates a pool of upstream API keys.
//!
//! Features:
//! - Round-robin key rotation with per-key cooldowns
//! - Rate limit detection in JSON bodies, headers and event streams
//! - One transparent retry with a fresh key when a call is rate limited
//! - Line-exact SSE relay with client disconnect propagation
//! - Optional free-only model listing

pub mod config;
pub mod detect;
pub mod error;
pub mod filter;
pub mod forward;
pub mod http;
pub mod keys;
pub mod proxy;
pub mod sse;
