// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use onsembl_protocol::AgentKind;

/// Wrapper configuration for `onsembl-agent start`.
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Control-plane server URL (ws:// or wss://; http(s) is upgraded).
    #[arg(long, env = "ONSEMBL_SERVER_URL", default_value = "ws://127.0.0.1:7080")]
    pub server_url: String,

    /// API key. Falls back to the stored credential from `auth login`.
    #[arg(long, env = "ONSEMBL_API_KEY")]
    pub api_key: Option<String>,

    /// Agent kind (claude, gemini, codex, custom).
    #[arg(long = "type", env = "ONSEMBL_AGENT_TYPE", default_value = "custom")]
    pub agent_type: String,

    /// Executable to supervise (must be on PATH or an absolute path).
    #[arg(long = "command", env = "ONSEMBL_AGENT_COMMAND")]
    pub agent_command: Option<String>,

    /// Human-readable agent name shown on dashboards.
    #[arg(long, env = "ONSEMBL_AGENT_NAME")]
    pub agent_name: Option<String>,

    /// Working directory for the child process.
    #[arg(long, env = "ONSEMBL_WORKING_DIRECTORY")]
    pub working_directory: Option<PathBuf>,

    /// Memory ceiling for the child, in MiB.
    #[arg(long, env = "ONSEMBL_MAX_MEMORY_MB", default_value = "1024")]
    pub max_memory_mb: u64,

    /// CPU ceiling for the child, in percent.
    #[arg(long, env = "ONSEMBL_MAX_CPU_PERCENT", default_value = "80")]
    pub max_cpu_percent: u8,

    /// Maximum reconnect attempts before giving up.
    #[arg(long, env = "ONSEMBL_RECONNECT_ATTEMPTS", default_value = "10")]
    pub reconnect_attempts: u32,

    /// Base reconnect delay in milliseconds.
    #[arg(long, env = "ONSEMBL_RECONNECT_BASE_DELAY", default_value = "1000")]
    pub reconnect_base_delay_ms: u64,

    /// Application heartbeat interval in milliseconds.
    #[arg(long, env = "ONSEMBL_HEARTBEAT_INTERVAL", default_value = "30000")]
    pub heartbeat_interval_ms: u64,

    /// Stream buffer size in bytes before an overflow flush.
    #[arg(long, env = "ONSEMBL_OUTPUT_BUFFER_SIZE", default_value = "8192")]
    pub output_buffer_size: usize,

    /// Cadence flush interval for partial output, in milliseconds.
    #[arg(long, env = "ONSEMBL_OUTPUT_FLUSH_INTERVAL", default_value = "100")]
    pub output_flush_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ONSEMBL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log file path (stderr when unset).
    #[arg(long, env = "ONSEMBL_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Model identifier passed to the child as ONSEMBL_MODEL.
    #[arg(long, env = "ONSEMBL_MODEL")]
    pub model: Option<String>,

    /// Token ceiling passed to the child as ONSEMBL_MAX_TOKENS.
    #[arg(long, env = "ONSEMBL_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature passed to the child as ONSEMBL_TEMPERATURE.
    #[arg(long, env = "ONSEMBL_TEMPERATURE")]
    pub temperature: Option<f64>,

    /// Override the per-kind execution mode: keep one long-running child
    /// and feed commands to its stdin.
    #[arg(long, env = "ONSEMBL_INTERACTIVE")]
    pub interactive: Option<bool>,

    /// Override the per-kind stop signal (etx, term, kill).
    #[arg(long, env = "ONSEMBL_STOP_SIGNAL")]
    pub stop_signal: Option<String>,

    /// State directory override (credentials, stable agent id).
    #[arg(long, env = "ONSEMBL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.kind()?;
        let Some(ref command) = self.agent_command else {
            anyhow::bail!("--command is required");
        };
        if resolve_on_path(command).is_none() {
            anyhow::bail!("agent command not found on PATH: {command}");
        }
        if let Some(ref signal) = self.stop_signal {
            match signal.as_str() {
                "etx" | "term" | "kill" => {}
                other => anyhow::bail!("invalid stop signal: {other}"),
            }
        }
        if self.max_cpu_percent == 0 || self.max_cpu_percent > 100 {
            anyhow::bail!("--max-cpu-percent must be within 1..=100");
        }
        Ok(())
    }

    pub fn kind(&self) -> anyhow::Result<AgentKind> {
        AgentKind::from_name(&self.agent_type)
            .ok_or_else(|| anyhow::anyhow!("invalid agent type: {}", self.agent_type))
    }

    /// Server URL with http(s) upgraded to ws(s).
    pub fn ws_url(&self) -> String {
        let url = self.server_url.trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url.to_owned()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn output_flush_interval(&self) -> Duration {
        Duration::from_millis(self.output_flush_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Environment passed through to the child process.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![];
        if let Some(ref model) = self.model {
            env.push(("ONSEMBL_MODEL".to_owned(), model.clone()));
        }
        if let Some(max_tokens) = self.max_tokens {
            env.push(("ONSEMBL_MAX_TOKENS".to_owned(), max_tokens.to_string()));
        }
        if let Some(temperature) = self.temperature {
            env.push(("ONSEMBL_TEMPERATURE".to_owned(), temperature.to_string()));
        }
        env
    }
}

/// Resolve an executable name against PATH (absolute paths pass through).
pub fn resolve_on_path(command: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(command);
    if direct.is_absolute() || command.contains('/') {
        return direct.exists().then_some(direct);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(command)).find(|p| p.exists())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
