// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Control-plane server for fleets of AI coding agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "onsembl-server", version, about)]
pub struct Config {
    /// Host address to bind to.
    #[arg(long, env = "ONSEMBL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port to listen on.
    #[arg(long, env = "ONSEMBL_PORT", default_value = "7080")]
    pub port: u16,

    /// Bearer token required from dashboards and agents.
    /// When unset, authentication is disabled (development only).
    #[arg(long, env = "ONSEMBL_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Directory for persisted state (agent directory, audit log).
    #[arg(long, env = "ONSEMBL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Transport ping interval in milliseconds.
    #[arg(long, env = "ONSEMBL_HEARTBEAT_INTERVAL", default_value = "30000")]
    pub heartbeat_interval_ms: u64,

    /// How long to wait for a pong before closing 4000.
    #[arg(long, env = "ONSEMBL_PONG_TIMEOUT", default_value = "10000")]
    pub pong_timeout_ms: u64,

    /// Outbound buffer high-watermark, in frames, before a connection is
    /// closed 4002 as a slow consumer.
    #[arg(long, env = "ONSEMBL_SEND_BUFFER_FRAMES", default_value = "256")]
    pub send_buffer_frames: usize,

    /// Grace window after an agent connection closes before the agent is
    /// marked offline.
    #[arg(long, env = "ONSEMBL_OFFLINE_GRACE", default_value = "15000")]
    pub offline_grace_ms: u64,

    /// Default command timeout in milliseconds.
    #[arg(long, env = "ONSEMBL_COMMAND_TIMEOUT", default_value = "300000")]
    pub command_timeout_ms: u64,

    /// How long to wait for an interrupt acknowledgement.
    #[arg(long, env = "ONSEMBL_INTERRUPT_GRACE", default_value = "2000")]
    pub interrupt_grace_ms: u64,

    /// Audit retention window in days. Older entries are filtered from
    /// queries and may be archived.
    #[arg(long, env = "ONSEMBL_AUDIT_RETENTION_DAYS", default_value = "30")]
    pub audit_retention_days: u32,

    /// Rotate the accepted bearer token on this interval (0 = disabled).
    /// Connected clients receive `token:refresh` instead of a reconnect.
    #[arg(long, env = "ONSEMBL_TOKEN_ROTATE_INTERVAL", default_value = "0")]
    pub token_rotate_interval_ms: u64,

    /// Consecutive protocol violations tolerated before closing 4003.
    #[arg(long, env = "ONSEMBL_PROTOCOL_VIOLATION_LIMIT", default_value = "10")]
    pub protocol_violation_limit: u32,

    /// Log format (json or text).
    #[arg(long, env = "ONSEMBL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ONSEMBL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("--heartbeat-interval-ms must be positive");
        }
        if self.pong_timeout_ms == 0 {
            anyhow::bail!("--pong-timeout-ms must be positive");
        }
        if self.send_buffer_frames == 0 {
            anyhow::bail!("--send-buffer-frames must be positive");
        }
        if self.command_timeout_ms == 0 {
            anyhow::bail!("--command-timeout-ms must be positive");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_millis(self.offline_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.audit_retention_days) * 24 * 60 * 60)
    }

    /// Config suitable for tests: fast timers, no auth, scratch dirs.
    pub fn for_tests(data_dir: Option<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            auth_token: None,
            data_dir,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            send_buffer_frames: 64,
            offline_grace_ms: 200,
            command_timeout_ms: 5_000,
            interrupt_grace_ms: 500,
            audit_retention_days: 30,
            token_rotate_interval_ms: 0,
            protocol_violation_limit: 10,
            log_format: "text".to_owned(),
            log_level: "warn".to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
