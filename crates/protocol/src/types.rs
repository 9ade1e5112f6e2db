// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Known agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
    Custom,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Custom => "custom",
        }
    }

    /// Parse a kind name as it appears on the CLI or the wire.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "codex" => Some(Self::Codex),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent as dashboards see it.
///
/// Legal transitions:
/// `connecting → ready ↔ busy → (stopping → offline) | error → connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connecting,
    Ready,
    Busy,
    Error,
    Stopping,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Offline => "offline",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            // Error is reachable from anywhere; offline likewise (socket loss).
            (_, Error) | (_, Offline) => true,
            (Connecting, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready, Stopping) | (Busy, Stopping) => true,
            (Error, Connecting) | (Offline, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    High,
    Normal,
    Low,
}

impl CommandPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Strict polling order: lower rank is polled first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl Default for CommandPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    /// A command reaches exactly one terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted | Self::Cancelled)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which child stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Which side of the bus may author a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Bidirectional,
}

/// Closed enumeration of wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // client → server
    DashboardConnect,
    AgentConnect,
    CommandRequest,
    CommandInterrupt,
    CommandComplete,
    AgentHeartbeat,
    DashboardSubscribe,
    // server → client
    ConnectionAck,
    AgentList,
    AgentStatus,
    AgentError,
    AgentControl,
    TerminalOutput,
    CommandStatus,
    CommandQueue,
    TokenRefresh,
    Error,
    // bidirectional
    Ping,
    Pong,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DashboardConnect => "dashboard:connect",
            Self::AgentConnect => "agent:connect",
            Self::CommandRequest => "command:request",
            Self::CommandInterrupt => "command:interrupt",
            Self::CommandComplete => "command:complete",
            Self::AgentHeartbeat => "agent:heartbeat",
            Self::DashboardSubscribe => "dashboard:subscribe",
            Self::ConnectionAck => "connection:ack",
            Self::AgentList => "agent:list",
            Self::AgentStatus => "agent:status",
            Self::AgentError => "agent:error",
            Self::AgentControl => "agent:control",
            Self::TerminalOutput => "terminal:output",
            Self::CommandStatus => "command:status",
            Self::CommandQueue => "command:queue",
            Self::TokenRefresh => "token:refresh",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "ack",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dashboard:connect" => Some(Self::DashboardConnect),
            "agent:connect" => Some(Self::AgentConnect),
            "command:request" => Some(Self::CommandRequest),
            "command:interrupt" => Some(Self::CommandInterrupt),
            "command:complete" => Some(Self::CommandComplete),
            "agent:heartbeat" => Some(Self::AgentHeartbeat),
            "dashboard:subscribe" => Some(Self::DashboardSubscribe),
            "connection:ack" => Some(Self::ConnectionAck),
            "agent:list" => Some(Self::AgentList),
            "agent:status" => Some(Self::AgentStatus),
            "agent:error" => Some(Self::AgentError),
            "agent:control" => Some(Self::AgentControl),
            "terminal:output" => Some(Self::TerminalOutput),
            "command:status" => Some(Self::CommandStatus),
            "command:queue" => Some(Self::CommandQueue),
            "token:refresh" => Some(Self::TokenRefresh),
            "error" => Some(Self::Error),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }

    /// Which side of the bus may author this type.
    ///
    /// `command:request` is bidirectional in practice: dashboards author it
    /// toward the server, and the server forwards it to agents.
    pub fn direction(&self) -> Direction {
        match self {
            Self::DashboardConnect
            | Self::AgentConnect
            | Self::CommandInterrupt
            | Self::CommandComplete
            | Self::AgentHeartbeat
            | Self::DashboardSubscribe => Direction::ClientToServer,
            Self::ConnectionAck
            | Self::AgentList
            | Self::AgentStatus
            | Self::AgentError
            | Self::AgentControl
            | Self::TerminalOutput
            | Self::CommandStatus
            | Self::CommandQueue
            | Self::TokenRefresh
            | Self::Error => Direction::ServerToClient,
            Self::CommandRequest | Self::Ping | Self::Pong | Self::Ack => Direction::Bidirectional,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
