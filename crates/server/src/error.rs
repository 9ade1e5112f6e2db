// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use onsembl_protocol::close_code;
use serde::{Deserialize, Serialize};

/// Wire-visible error codes carried by `error{code, message, recoverable}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Protocol,
    Auth,
    Resource,
    Command,
    AgentUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "PROTOCOL",
            Self::Auth => "AUTH",
            Self::Resource => "RESOURCE",
            Self::Command => "COMMAND",
            Self::AgentUnavailable => "AGENT_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the peer can reasonably retry after this error.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Protocol | Self::Command | Self::AgentUnavailable => true,
            Self::Auth | Self::Resource | Self::Internal => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a connection is closed, mapped onto the protocol close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    HeartbeatTimeout,
    Superseded,
    SlowConsumer,
    AuthFailed,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => close_code::NORMAL,
            Self::HeartbeatTimeout => close_code::HEARTBEAT_TIMEOUT,
            Self::Superseded => close_code::SUPERSEDED,
            Self::SlowConsumer => close_code::SLOW_CONSUMER,
            Self::AuthFailed => close_code::AUTH_FAILED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::HeartbeatTimeout => "heartbeat-timeout",
            Self::Superseded => "superseded",
            Self::SlowConsumer => "slow-consumer",
            Self::AuthFailed => "auth-failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
