// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Application-level heartbeat tracking.
//!
//! Transport pings keep sockets honest; this module watches the
//! `agent:heartbeat` cadence on top. An agent that stops sending health
//! metrics for three intervals is marked offline even if its socket is
//! still open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use onsembl_protocol::messages::{AgentHeartbeat, AgentStatusUpdate, HealthMetrics, Message};
use onsembl_protocol::{AgentStatus, Frame};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::directory::AgentDirectory;
use crate::registry::ConnectionRegistry;

const STALE_INTERVALS: u32 = 3;

/// Last heartbeat seen per agent, plus its reported metrics.
#[derive(Default)]
pub struct HeartbeatTracker {
    seen: RwLock<HashMap<Uuid, (Instant, HealthMetrics)>>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn note(&self, beat: &AgentHeartbeat) {
        self.seen
            .write()
            .await
            .insert(beat.agent_id, (Instant::now(), beat.health_metrics.clone()));
    }

    pub async fn metrics(&self, agent_id: Uuid) -> Option<HealthMetrics> {
        self.seen.read().await.get(&agent_id).map(|(_, m)| m.clone())
    }

    pub async fn forget(&self, agent_id: Uuid) {
        self.seen.write().await.remove(&agent_id);
    }

    /// Agents whose last heartbeat is older than `interval * STALE_INTERVALS`.
    pub async fn stale(&self, interval: Duration) -> Vec<Uuid> {
        let cutoff = interval * STALE_INTERVALS;
        self.seen
            .read()
            .await
            .iter()
            .filter(|(_, (at, _))| at.elapsed() > cutoff)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Spawn the staleness sweeper. Stale agents go offline and dashboards are
/// told, regardless of socket state.
pub fn spawn_staleness_checker(
    tracker: Arc<HeartbeatTracker>,
    directory: Arc<AgentDirectory>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            for agent_id in tracker.stale(interval).await {
                let Some(record) = directory.get(agent_id).await else {
                    tracker.forget(agent_id).await;
                    continue;
                };
                if record.status == AgentStatus::Offline {
                    continue;
                }
                tracing::warn!(agent_id = %agent_id, "heartbeats stale, marking offline");
                directory.set_status(agent_id, AgentStatus::Offline).await;
                tracker.forget(agent_id).await;

                let update = Message::AgentStatus(AgentStatusUpdate {
                    agent_id,
                    agent_type: record.kind,
                    status: AgentStatus::Offline,
                    capabilities: None,
                    metadata: None,
                });
                if let Ok(bytes) = Frame::authored(update).encode() {
                    registry.broadcast_to_subscribers(agent_id, &bytes, None).await;
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
