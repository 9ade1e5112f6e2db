// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed payloads for every message in the catalogue.
//!
//! Field names follow the wire contract (camelCase). Authored messages are
//! serialized from these structs, which strips any unknown fields a peer may
//! have attached; pass-through forwarding keeps the raw payload instead (see
//! [`crate::frame::Frame::encode_forwarded`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    AgentKind, AgentStatus, CommandPriority, CommandState, MessageType, StreamKind,
};

/// Declared capabilities of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_interrupt: bool,
    #[serde(default)]
    pub supports_trace: bool,
}

/// Host metadata reported by the wrapper at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMachine {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Periodic health metrics carried by `agent:heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
    pub commands_processed: u64,
    pub average_response_ms: f64,
}

/// Execution constraints attached to a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Retain this command's output chunks on the server.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persist_output: bool,
}

// ---------------------------------------------------------------------------
// client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConnect {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnect {
    pub agent_id: Uuid,
    pub agent_type: AgentKind,
    pub agent_name: String,
    pub version: String,
    pub host_machine: HostMachine,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command_id: Uuid,
    pub agent_id: Uuid,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub options: CommandOptions,
    #[serde(default)]
    pub priority: CommandPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInterrupt {
    pub command_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Wrapper → server: the dispatched command reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandComplete {
    pub command_id: Uuid,
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub agent_id: Uuid,
    pub health_metrics: HealthMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSubscribe {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_ids: Vec<Uuid>,
    /// Subscribe to every agent, current and future.
    #[serde(default)]
    pub all: bool,
}

// ---------------------------------------------------------------------------
// server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub connection_id: Uuid,
    pub server_version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// One agent as it appears in `agent:list` and the dashboard directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub agent_type: AgentKind,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentList {
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusUpdate {
    pub agent_id: Uuid,
    pub agent_type: AgentKind,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<AgentCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    pub agent_id: Uuid,
    pub code: String,
    pub message: String,
}

/// Server → wrapper lifecycle directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControl {
    pub agent_id: Uuid,
    pub action: ControlAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Restart,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub command_id: Uuid,
    pub agent_id: Uuid,
    pub data: String,
    pub stream: StreamKind,
    /// Strictly increasing, contiguous from 1 per command.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansi_codes: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_blank: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub command_id: Uuid,
    pub agent_id: Uuid,
    pub status: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds from dispatch to terminal state, stamped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// One queued command as it appears in `command:queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub command_id: Uuid,
    pub priority: CommandPriority,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueueUpdate {
    pub agent_id: Uuid,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefresh {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
}

// ---------------------------------------------------------------------------
// bidirectional
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pong {}

/// Acknowledges receipt of the frame named by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub id: Uuid,
}

/// A decoded message, one variant per catalogue type.
#[derive(Debug, Clone)]
pub enum Message {
    DashboardConnect(DashboardConnect),
    AgentConnect(AgentConnect),
    CommandRequest(CommandRequest),
    CommandInterrupt(CommandInterrupt),
    CommandComplete(CommandComplete),
    AgentHeartbeat(AgentHeartbeat),
    DashboardSubscribe(DashboardSubscribe),
    ConnectionAck(ConnectionAck),
    AgentList(AgentList),
    AgentStatus(AgentStatusUpdate),
    AgentError(AgentError),
    AgentControl(AgentControl),
    TerminalOutput(TerminalOutput),
    CommandStatus(CommandStatusUpdate),
    CommandQueue(CommandQueueUpdate),
    TokenRefresh(TokenRefresh),
    Error(ErrorMessage),
    Ping(Ping),
    Pong(Pong),
    Ack(Ack),
}

impl Message {
    /// The wire type tag for this message.
    pub fn kind(&self) -> MessageType {
        match self {
            Self::DashboardConnect(_) => MessageType::DashboardConnect,
            Self::AgentConnect(_) => MessageType::AgentConnect,
            Self::CommandRequest(_) => MessageType::CommandRequest,
            Self::CommandInterrupt(_) => MessageType::CommandInterrupt,
            Self::CommandComplete(_) => MessageType::CommandComplete,
            Self::AgentHeartbeat(_) => MessageType::AgentHeartbeat,
            Self::DashboardSubscribe(_) => MessageType::DashboardSubscribe,
            Self::ConnectionAck(_) => MessageType::ConnectionAck,
            Self::AgentList(_) => MessageType::AgentList,
            Self::AgentStatus(_) => MessageType::AgentStatus,
            Self::AgentError(_) => MessageType::AgentError,
            Self::AgentControl(_) => MessageType::AgentControl,
            Self::TerminalOutput(_) => MessageType::TerminalOutput,
            Self::CommandStatus(_) => MessageType::CommandStatus,
            Self::CommandQueue(_) => MessageType::CommandQueue,
            Self::TokenRefresh(_) => MessageType::TokenRefresh,
            Self::Error(_) => MessageType::Error,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Ack(_) => MessageType::Ack,
        }
    }

    /// Serialize the payload from the typed struct (drops unknown fields).
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::DashboardConnect(p) => serde_json::to_value(p),
            Self::AgentConnect(p) => serde_json::to_value(p),
            Self::CommandRequest(p) => serde_json::to_value(p),
            Self::CommandInterrupt(p) => serde_json::to_value(p),
            Self::CommandComplete(p) => serde_json::to_value(p),
            Self::AgentHeartbeat(p) => serde_json::to_value(p),
            Self::DashboardSubscribe(p) => serde_json::to_value(p),
            Self::ConnectionAck(p) => serde_json::to_value(p),
            Self::AgentList(p) => serde_json::to_value(p),
            Self::AgentStatus(p) => serde_json::to_value(p),
            Self::AgentError(p) => serde_json::to_value(p),
            Self::AgentControl(p) => serde_json::to_value(p),
            Self::TerminalOutput(p) => serde_json::to_value(p),
            Self::CommandStatus(p) => serde_json::to_value(p),
            Self::CommandQueue(p) => serde_json::to_value(p),
            Self::TokenRefresh(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::Ping(p) => serde_json::to_value(p),
            Self::Pong(p) => serde_json::to_value(p),
            Self::Ack(p) => serde_json::to_value(p),
        }
    }

    /// Deserialize a payload of the given type.
    pub fn from_payload(kind: MessageType, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageType::DashboardConnect => {
                Self::DashboardConnect(serde_json::from_value(payload)?)
            }
            MessageType::AgentConnect => Self::AgentConnect(serde_json::from_value(payload)?),
            MessageType::CommandRequest => Self::CommandRequest(serde_json::from_value(payload)?),
            MessageType::CommandInterrupt => {
                Self::CommandInterrupt(serde_json::from_value(payload)?)
            }
            MessageType::CommandComplete => Self::CommandComplete(serde_json::from_value(payload)?),
            MessageType::AgentHeartbeat => Self::AgentHeartbeat(serde_json::from_value(payload)?),
            MessageType::DashboardSubscribe => {
                Self::DashboardSubscribe(serde_json::from_value(payload)?)
            }
            MessageType::ConnectionAck => Self::ConnectionAck(serde_json::from_value(payload)?),
            MessageType::AgentList => Self::AgentList(serde_json::from_value(payload)?),
            MessageType::AgentStatus => Self::AgentStatus(serde_json::from_value(payload)?),
            MessageType::AgentError => Self::AgentError(serde_json::from_value(payload)?),
            MessageType::AgentControl => Self::AgentControl(serde_json::from_value(payload)?),
            MessageType::TerminalOutput => Self::TerminalOutput(serde_json::from_value(payload)?),
            MessageType::CommandStatus => Self::CommandStatus(serde_json::from_value(payload)?),
            MessageType::CommandQueue => Self::CommandQueue(serde_json::from_value(payload)?),
            MessageType::TokenRefresh => Self::TokenRefresh(serde_json::from_value(payload)?),
            MessageType::Error => Self::Error(serde_json::from_value(payload)?),
            MessageType::Ping => Self::Ping(serde_json::from_value(payload)?),
            MessageType::Pong => Self::Pong(serde_json::from_value(payload)?),
            MessageType::Ack => Self::Ack(serde_json::from_value(payload)?),
        })
    }
}

#[cfg(test)]
#[path = "messages_tests.rs"]
mod tests;
