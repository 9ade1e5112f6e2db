// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent directory: stable identity and status for every agent ever seen.
//!
//! Identity (id ↔ name, kind, declared capabilities) is persisted as JSON in
//! the data dir so dashboards see the same agent across wrapper restarts.
//! Status, host metadata, and counters are in-memory only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use onsembl_protocol::messages::{AgentCapabilities, AgentConnect, AgentSummary, HostMachine};
use onsembl_protocol::{epoch_ms, AgentKind, AgentStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One agent as the server tracks it.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub capabilities: AgentCapabilities,
    pub host: HostMachine,
    pub version: String,
    pub last_seen_ms: i64,
    pub restart_count: u32,
    /// Bumped on every (re)connect; lets the offline grace timer detect that
    /// a newer session took over while it slept.
    pub session_epoch: u64,
}

impl AgentRecord {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.id,
            agent_name: self.name.clone(),
            agent_type: self.kind,
            status: self.status,
            capabilities: self.capabilities.clone(),
            last_seen_ms: Some(self.last_seen_ms),
        }
    }
}

/// Identity rows persisted between server restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedAgent {
    id: Uuid,
    name: String,
    kind: AgentKind,
    #[serde(default)]
    capabilities: AgentCapabilities,
}

/// Outcome of a status transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The transition is not legal from the current status; state unchanged.
    Rejected(AgentStatus),
    UnknownAgent,
}

pub struct AgentDirectory {
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
    path: Option<PathBuf>,
    epoch: AtomicU64,
}

impl AgentDirectory {
    /// Open the directory, loading persisted identities (as `offline`).
    pub fn open(data_dir: Option<&std::path::Path>) -> Self {
        let path = data_dir.map(|d| {
            let _ = std::fs::create_dir_all(d);
            d.join("agents.json")
        });
        let mut agents = HashMap::new();
        if let Some(ref p) = path {
            if let Ok(contents) = std::fs::read_to_string(p) {
                if let Ok(rows) = serde_json::from_str::<Vec<PersistedAgent>>(&contents) {
                    for row in rows {
                        agents.insert(
                            row.id,
                            AgentRecord {
                                id: row.id,
                                name: row.name,
                                kind: row.kind,
                                status: AgentStatus::Offline,
                                capabilities: row.capabilities,
                                host: HostMachine::default(),
                                version: String::new(),
                                last_seen_ms: 0,
                                restart_count: 0,
                                session_epoch: 0,
                            },
                        );
                    }
                }
            }
        }
        Self { agents: RwLock::new(agents), path, epoch: AtomicU64::new(1) }
    }

    /// Create or refresh a record from `agent:connect`. Returns the new
    /// session epoch for the offline grace timer.
    pub async fn upsert_connect(&self, connect: &AgentConnect) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut agents = self.agents.write().await;
            let record = agents.entry(connect.agent_id).or_insert_with(|| AgentRecord {
                id: connect.agent_id,
                name: connect.agent_name.clone(),
                kind: connect.agent_type,
                status: AgentStatus::Connecting,
                capabilities: AgentCapabilities::default(),
                host: HostMachine::default(),
                version: String::new(),
                last_seen_ms: 0,
                restart_count: 0,
                session_epoch: 0,
            });
            record.name = connect.agent_name.clone();
            record.kind = connect.agent_type;
            record.capabilities = connect.capabilities.clone();
            record.host = connect.host_machine.clone();
            record.version = connect.version.clone();
            record.status = AgentStatus::Connecting;
            record.last_seen_ms = epoch_ms();
            record.session_epoch = epoch;
        }
        self.persist().await;
        epoch
    }

    /// Apply a status transition, enforcing the legality rules.
    pub async fn set_status(&self, agent_id: Uuid, next: AgentStatus) -> Transition {
        let mut agents = self.agents.write().await;
        let Some(record) = agents.get_mut(&agent_id) else {
            return Transition::UnknownAgent;
        };
        if !record.status.can_transition_to(next) {
            tracing::warn!(
                agent_id = %agent_id,
                from = %record.status,
                to = %next,
                "illegal status transition rejected"
            );
            return Transition::Rejected(record.status);
        }
        record.status = next;
        record.last_seen_ms = epoch_ms();
        Transition::Applied
    }

    /// Mark offline only if no newer session has taken over.
    pub async fn set_offline_if_epoch(&self, agent_id: Uuid, epoch: u64) -> bool {
        let mut agents = self.agents.write().await;
        let Some(record) = agents.get_mut(&agent_id) else {
            return false;
        };
        if record.session_epoch != epoch || record.status == AgentStatus::Offline {
            return false;
        }
        record.status = AgentStatus::Offline;
        true
    }

    pub async fn bump_restart_count(&self, agent_id: Uuid) {
        if let Some(record) = self.agents.write().await.get_mut(&agent_id) {
            record.restart_count += 1;
        }
    }

    pub async fn touch(&self, agent_id: Uuid) {
        if let Some(record) = self.agents.write().await.get_mut(&agent_id) {
            record.last_seen_ms = epoch_ms();
        }
    }

    pub async fn get(&self, agent_id: Uuid) -> Option<AgentRecord> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    pub async fn status(&self, agent_id: Uuid) -> Option<AgentStatus> {
        self.agents.read().await.get(&agent_id).map(|r| r.status)
    }

    /// Sorted snapshot for `agent:list`.
    pub async fn snapshot(&self) -> Vec<AgentSummary> {
        let mut rows: Vec<AgentSummary> =
            self.agents.read().await.values().map(AgentRecord::summary).collect();
        rows.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        rows
    }

    /// Agent ids currently in a given status.
    pub async fn ids_with_status(&self, status: AgentStatus) -> Vec<Uuid> {
        self.agents.read().await.values().filter(|r| r.status == status).map(|r| r.id).collect()
    }

    /// All known agent ids.
    pub async fn ids(&self) -> Vec<Uuid> {
        self.agents.read().await.keys().copied().collect()
    }

    /// Best-effort write of the identity rows.
    async fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let rows: Vec<PersistedAgent> = self
            .agents
            .read()
            .await
            .values()
            .map(|r| PersistedAgent {
                id: r.id,
                name: r.name.clone(),
                kind: r.kind,
                capabilities: r.capabilities.clone(),
            })
            .collect();
        let Ok(json) = serde_json::to_vec_pretty(&rows) else {
            return;
        };
        if let Err(e) = std::fs::write(path, json) {
            tracing::warn!(err = %e, "failed to persist agent directory");
        }
    }
}

#[cfg(test)]
#[path = "directory_tests.rs"]
mod tests;
