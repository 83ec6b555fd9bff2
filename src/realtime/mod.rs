//! Realtime telemetry modules.
//!
//! - `client`: websocket transport, event fan-out, and reconnect handling.
//! - `proto`: event envelope and payload types shared with the backend.
//! - `telemetry`: subscribable snapshot of live device and guardian state.

/// Websocket connection and event pub/sub surface.
pub mod client;
/// Realtime wire format.
pub mod proto;
/// Shared telemetry snapshot store.
pub mod telemetry;
