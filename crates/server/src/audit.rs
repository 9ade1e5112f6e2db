// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed append-only audit trail.
//!
//! Entries are appended as JSONL through a single-producer funnel so the
//! recorded order is total. Entries are immutable once written; the
//! retention window is enforced at query time (authoritative), and
//! `archive_expired` merely moves expired lines to a sibling `.archive`
//! file without ever editing them.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;

use onsembl_protocol::epoch_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Closed enumeration of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    UserLogin,
    UserLogout,
    AgentConnect,
    AgentDisconnect,
    CommandSent,
    CommandCompleted,
    PresetCreated,
    PresetUpdated,
    EmergencyStop,
    AgentError,
    ConfigChange,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserLogin => "user-login",
            Self::UserLogout => "user-logout",
            Self::AgentConnect => "agent-connect",
            Self::AgentDisconnect => "agent-disconnect",
            Self::CommandSent => "command-sent",
            Self::CommandCompleted => "command-completed",
            Self::PresetCreated => "preset-created",
            Self::PresetUpdated => "preset-updated",
            Self::EmergencyStop => "emergency-stop",
            Self::AgentError => "agent-error",
            Self::ConfigChange => "config-change",
        }
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub timestamp_ms: i64,
}

impl AuditEntry {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: None,
            agent_id: None,
            command_id: None,
            details: BTreeMap::new(),
            source_ip: None,
            user_agent: None,
            timestamp_ms: epoch_ms(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_command(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Merge a whole map of details (e.g. a raw connect payload).
    pub fn with_details_map(mut self, map: BTreeMap<String, Value>) -> Self {
        self.details.extend(map);
        self
    }

    pub fn with_source(mut self, ip: impl Into<String>, user_agent: Option<String>) -> Self {
        self.source_ip = Some(ip.into());
        self.user_agent = user_agent;
        self
    }
}

/// Query filters. All optional; time range is half-open `[since, until)`.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kind: Option<AuditKind>,
    pub user_id: Option<String>,
    pub agent_id: Option<Uuid>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub limit: Option<usize>,
}

const DEFAULT_QUERY_LIMIT: usize = 100;

/// Keys whose values must never reach the log.
const SENSITIVE_KEYS: [&str; 5] = ["password", "token", "secret", "refresh_token", "accessToken"];

/// Redact sensitive fields from a details map before persistence.
///
/// `password`-style fields keep the key with a `[REDACTED]` marker so the
/// entry shows the field was supplied; token-style fields are dropped
/// entirely, since even their presence plus length would narrow a search.
pub fn redact(details: &mut BTreeMap<String, Value>) {
    let keys: Vec<String> = details.keys().cloned().collect();
    for key in keys {
        if !SENSITIVE_KEYS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "token" | "accessToken" | "refresh_token" | "secret" => {
                details.remove(&key);
            }
            _ => {
                details.insert(key, Value::String("[REDACTED]".to_owned()));
            }
        }
    }
}

enum FunnelOp {
    Append(Box<AuditEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit store. Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<FunnelOp>,
    path: Option<PathBuf>,
    retention_ms: i64,
}

impl AuditLog {
    /// Open the log, spawning the single writer task behind the funnel.
    /// With no data dir the log is a sink: appends vanish, queries are empty.
    pub fn open(data_dir: Option<&std::path::Path>, retention: std::time::Duration) -> Self {
        let path = data_dir.map(|d| {
            let _ = std::fs::create_dir_all(d);
            d.join("audit.jsonl")
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_path = path.clone();
        tokio::spawn(run_writer(writer_path, rx));
        Self { tx, path, retention_ms: retention.as_millis() as i64 }
    }

    /// Append an entry. Redaction happens here, before the funnel, so the
    /// unredacted value never crosses a task boundary.
    pub fn record(&self, mut entry: AuditEntry) {
        redact(&mut entry.details);
        let _ = self.tx.send(FunnelOp::Append(Box::new(entry)));
    }

    /// Wait until everything recorded so far has hit the file.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(FunnelOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Query entries, newest last, applying filters and the retention
    /// window. The retention cut is query-time and authoritative.
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.flush().await;
        let Some(ref path) = self.path else {
            return vec![];
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return vec![];
        };
        let floor = epoch_ms() - self.retention_ms;
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        contents
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .filter(|e| e.timestamp_ms >= floor)
            .filter(|e| query.kind.is_none_or(|k| e.kind == k))
            .filter(|e| query.user_id.as_ref().is_none_or(|u| e.user_id.as_ref() == Some(u)))
            .filter(|e| query.agent_id.is_none_or(|a| e.agent_id == Some(a)))
            .filter(|e| query.since_ms.is_none_or(|s| e.timestamp_ms >= s))
            .filter(|e| query.until_ms.is_none_or(|u| e.timestamp_ms < u))
            .take(limit)
            .collect()
    }

    /// Archival hook: move entries older than the retention window into a
    /// sibling `.archive` file. Queries never consult the archive.
    pub async fn archive_expired(&self) -> usize {
        self.flush().await;
        let Some(ref path) = self.path else {
            return 0;
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return 0;
        };
        let floor = epoch_ms() - self.retention_ms;
        let mut kept = String::new();
        let mut archived = String::new();
        let mut count = 0usize;
        for line in contents.lines() {
            let expired = serde_json::from_str::<AuditEntry>(line)
                .map(|e| e.timestamp_ms < floor)
                .unwrap_or(false);
            if expired {
                archived.push_str(line);
                archived.push('\n');
                count += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        if count > 0 {
            let archive_path = path.with_extension("jsonl.archive");
            if let Ok(mut file) =
                std::fs::OpenOptions::new().create(true).append(true).open(&archive_path)
            {
                let _ = file.write_all(archived.as_bytes());
            }
            let _ = std::fs::write(path, kept);
        }
        count
    }

    /// One-time startup sweep: every `command-sent` from a previous run with
    /// no matching `command-completed` gets a synthetic completion recording
    /// `failed{shutdown}`. Returns the swept command ids.
    pub async fn sweep_unfinished(&self) -> Vec<Uuid> {
        let Some(ref path) = self.path else {
            return vec![];
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return vec![];
        };
        let mut sent: Vec<(Uuid, Option<Uuid>)> = vec![];
        let mut completed: HashSet<Uuid> = HashSet::new();
        for entry in contents.lines().filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok()) {
            match (entry.kind, entry.command_id) {
                (AuditKind::CommandSent, Some(cmd)) => sent.push((cmd, entry.agent_id)),
                (AuditKind::CommandCompleted, Some(cmd)) => {
                    completed.insert(cmd);
                }
                _ => {}
            }
        }
        let mut swept = vec![];
        for (cmd, agent) in sent {
            if completed.contains(&cmd) {
                continue;
            }
            let mut entry = AuditEntry::new(AuditKind::CommandCompleted)
                .with_command(cmd)
                .with_detail("status", "failed")
                .with_detail("reason", "shutdown");
            if let Some(agent_id) = agent {
                entry = entry.with_agent(agent_id);
            }
            self.record(entry);
            swept.push(cmd);
        }
        self.flush().await;
        swept
    }
}

/// The single writer behind the funnel. Keeps the seen-id set for
/// idempotent appends.
async fn run_writer(path: Option<PathBuf>, mut rx: mpsc::UnboundedReceiver<FunnelOp>) {
    let mut seen: HashSet<Uuid> = HashSet::new();
    if let Some(ref p) = path {
        if let Ok(contents) = std::fs::read_to_string(p) {
            seen.extend(
                contents
                    .lines()
                    .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
                    .map(|e| e.id),
            );
        }
    }

    while let Some(op) = rx.recv().await {
        match op {
            FunnelOp::Append(entry) => {
                let Some(ref p) = path else {
                    continue;
                };
                if !seen.insert(entry.id) {
                    continue;
                }
                let Ok(mut line) = serde_json::to_string(&*entry) else {
                    continue;
                };
                line.push('\n');
                let Ok(mut file) =
                    std::fs::OpenOptions::new().create(true).append(true).open(p)
                else {
                    continue;
                };
                let _ = file.write_all(line.as_bytes());
            }
            FunnelOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
