//! Client SDK for MiniChat realtime messaging.
//!
//! The crate is organized by concern:
//! - `session`: multi-identity credential store with an active-session pointer.
//! - `realtime`: authenticated websocket client with heartbeat liveness and
//!   bounded reconnects.
//! - `api`: request/response client that applies the active credential.
//! - `config`: server endpoint configuration.
//! - `retry`: shared reconnect, retry and timeout policies.

/// Authenticated request/response client.
pub mod api;
/// Server endpoint configuration.
pub mod config;
/// Realtime connection client and wire envelopes.
pub mod realtime;
/// Reconnect, retry and timeout helpers.
pub mod retry;
/// Session-scoped credential store.
pub mod session;
