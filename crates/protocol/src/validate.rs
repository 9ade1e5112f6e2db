// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-type payload validators beyond what the type system enforces.
//!
//! Enum membership and UUID shape are already guaranteed by the typed
//! structs; these checks cover value-level constraints the schema cannot
//! express (non-empty strings, sequence lower bounds, sane metric ranges).

use crate::error::DecodeError;
use crate::messages::Message;

const MAX_CHUNK_BYTES: usize = 10_000;

fn reject(kind: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Invalid { kind, reason: reason.into() }
}

/// Validate a decoded message. Called by [`crate::frame::Frame::decode`].
pub fn message(msg: &Message) -> Result<(), DecodeError> {
    match msg {
        Message::DashboardConnect(p) => {
            if p.token.is_empty() {
                return Err(reject("dashboard:connect", "token must not be empty"));
            }
        }
        Message::AgentConnect(p) => {
            if p.agent_name.is_empty() {
                return Err(reject("agent:connect", "agentName must not be empty"));
            }
            if p.host_machine.hostname.is_empty() {
                return Err(reject("agent:connect", "hostMachine.hostname must not be empty"));
            }
        }
        Message::CommandRequest(p) => {
            if p.command.is_empty() {
                return Err(reject("command:request", "command must not be empty"));
            }
            if let Some(timeout) = p.options.timeout_ms {
                if timeout == 0 {
                    return Err(reject("command:request", "options.timeoutMs must be positive"));
                }
            }
        }
        Message::CommandComplete(p) => {
            if p.interrupted && p.exit_code.is_some() {
                return Err(reject(
                    "command:complete",
                    "interrupted completions carry no exit code",
                ));
            }
        }
        Message::AgentHeartbeat(p) => {
            let m = &p.health_metrics;
            if !(0.0..=100.0).contains(&m.cpu_percent) {
                return Err(reject("agent:heartbeat", "cpuPercent must be within 0..=100"));
            }
            if m.average_response_ms < 0.0 {
                return Err(reject("agent:heartbeat", "averageResponseMs must not be negative"));
            }
        }
        Message::TerminalOutput(p) => {
            if p.sequence == 0 {
                return Err(reject("terminal:output", "sequence starts at 1"));
            }
            if p.data.len() > MAX_CHUNK_BYTES {
                return Err(reject(
                    "terminal:output",
                    format!("data exceeds {MAX_CHUNK_BYTES} bytes"),
                ));
            }
        }
        Message::TokenRefresh(p) => {
            if p.access_token.is_empty() {
                return Err(reject("token:refresh", "accessToken must not be empty"));
            }
            if p.expires_in == 0 {
                return Err(reject("token:refresh", "expiresIn must be positive"));
            }
        }
        Message::Error(p) => {
            if p.code.is_empty() {
                return Err(reject("error", "code must not be empty"));
            }
        }
        // Remaining types have no constraints beyond their schema.
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
