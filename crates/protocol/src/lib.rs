// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol for the Onsembl control bus.
//!
//! Every frame on the wire is JSON of shape
//! `{version, type, id, timestamp, payload}`. This crate owns the envelope,
//! the closed message catalogue, and the per-type validators both the server
//! and the agent wrapper rely on.

pub mod error;
pub mod frame;
pub mod messages;
pub mod types;
pub mod validate;

pub use error::DecodeError;
pub use frame::{Frame, PROTOCOL_VERSION};
pub use messages::Message;
pub use types::{
    AgentKind, AgentStatus, CommandPriority, CommandState, Direction, MessageType, StreamKind,
};

/// WebSocket close codes used by the bus.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// No pong within the watchdog window.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
    /// A newer connection for the same agent replaced this one.
    pub const SUPERSEDED: u16 = 4001;
    /// Outbound buffer exceeded the high-watermark.
    pub const SLOW_CONSUMER: u16 = 4002;
    /// Authentication failed and could not be refreshed.
    pub const AUTH_FAILED: u16 = 4003;
}

/// Current epoch milliseconds.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
