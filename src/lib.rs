//! User-facing Rust SDK for the GuardLink dashboard backend.
//!
//! The crate is organized by transport surface:
//! - `session`: authenticated HTTP client with transparent re-authentication.
//! - `realtime`: telemetry websocket client, protocol types, and state store.
//! - `backoff`: reconnect policy used by long-lived connections.

/// Reconnect policy and backoff helpers.
pub mod backoff;
/// Realtime telemetry client, protocol types, and the telemetry store.
pub mod realtime;
/// Authenticated HTTP session client.
pub mod session;
