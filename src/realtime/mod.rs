//! Realtime messaging modules.
//!
//! - `client`: websocket connection, heartbeat liveness, and bounded
//!   reconnects authenticated by the active session.
//! - `proto`: JSON envelopes exchanged with the message server.

/// Websocket connection client and subscriber registry.
pub mod client;
/// Realtime wire envelopes.
pub mod proto;

pub use client::{
    CloseReason, ConnectionStatus, RealtimeClient, RealtimeDefaults, RealtimeError,
    RealtimeOptions, LOCAL_REALTIME_ENDPOINT,
};
pub use proto::{ClientFrame, ServerFrame};
