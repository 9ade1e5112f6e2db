// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry: owns every live transport.
//!
//! Each connection has a bounded outbound queue drained by its socket's
//! writer half. The queue bound is the slow-consumer high-watermark: a full
//! queue closes the connection with 4002 rather than letting one stalled
//! dashboard hold memory for the whole fleet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CloseReason;

/// Transport kind of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Agent,
    Dashboard,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Dashboard => "dashboard",
        }
    }
}

/// What the writer task should do next.
#[derive(Debug)]
pub enum Outbound {
    /// A fully encoded frame to write as a text message.
    Frame(Vec<u8>),
    /// Write a close frame and stop.
    Close(u16, &'static str),
}

/// Result of [`ConnectionRegistry::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// The connection is gone (closed, or just closed for slow-consumer).
    Gone,
}

/// Dashboard subscription set.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pub all: bool,
    pub agent_ids: HashSet<Uuid>,
}

impl Subscriptions {
    pub fn contains(&self, agent_id: &Uuid) -> bool {
        self.all || self.agent_ids.contains(agent_id)
    }
}

/// One live connection.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub kind: ConnectionKind,
    pub principal: String,
    /// Bound agent id (agent connections only).
    pub agent_id: Option<Uuid>,
    /// Subscribed agent ids (dashboard connections only).
    pub subscriptions: RwLock<Subscriptions>,
    /// Monotonic per-connection send sequence.
    pub send_seq: AtomicU64,
    /// Last pong observed by the socket loop.
    pub last_pong: parking_lot::Mutex<Instant>,
    /// Cancelled exactly once when the connection is torn down.
    pub closed: CancellationToken,
    /// Why the registry closed this connection. The outbound buffer may be
    /// full at close time (slow-consumer), so the reason lives here too.
    close_reason: parking_lot::Mutex<Option<CloseReason>>,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Record a pong, resetting the heartbeat watchdog.
    pub fn note_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Elapsed time since the last pong.
    pub fn since_last_pong(&self) -> std::time::Duration {
        self.last_pong.lock().elapsed()
    }

    /// Why the registry closed this connection, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }
}

/// Registry of all live connections, keyed by connection id, with a side
/// index from agent id to its single live agent connection.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
    by_agent: RwLock<HashMap<Uuid, Uuid>>,
    buffer_frames: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer_frames: usize) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
            buffer_frames,
        }
    }

    /// Register a new connection and hand back its handle plus the receiver
    /// the socket's writer half must drain.
    ///
    /// For agent connections this enforces the one-live-connection rule:
    /// any prior connection bound to the same agent id is closed 4001.
    pub async fn accept(
        &self,
        kind: ConnectionKind,
        principal: String,
        agent_id: Option<Uuid>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.buffer_frames);
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            kind,
            principal,
            agent_id,
            subscriptions: RwLock::new(Subscriptions::default()),
            send_seq: AtomicU64::new(0),
            last_pong: parking_lot::Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
            close_reason: parking_lot::Mutex::new(None),
            outbound: tx,
        });

        if let (ConnectionKind::Agent, Some(agent)) = (kind, agent_id) {
            let superseded = {
                let mut by_agent = self.by_agent.write().await;
                by_agent.insert(agent, handle.id)
            };
            if let Some(old_id) = superseded {
                tracing::info!(agent_id = %agent, old_conn = %old_id, "superseding agent connection");
                self.close(old_id, CloseReason::Superseded).await;
            }
        }

        self.conns.write().await.insert(handle.id, Arc::clone(&handle));
        (handle, rx)
    }

    pub async fn get(&self, conn_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.conns.read().await.get(&conn_id).map(Arc::clone)
    }

    /// The live agent connection for an agent id, if any.
    pub async fn agent_connection(&self, agent_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let conn_id = *self.by_agent.read().await.get(&agent_id)?;
        self.get(conn_id).await
    }

    /// Enqueue an encoded frame onto a connection's outbound buffer.
    ///
    /// Overflow means the consumer is not keeping up: the connection is
    /// closed 4002 and the caller is told `Gone`.
    pub async fn send(&self, conn_id: Uuid, bytes: Vec<u8>) -> SendOutcome {
        let Some(handle) = self.get(conn_id).await else {
            return SendOutcome::Gone;
        };
        self.send_to(&handle, bytes).await
    }

    /// [`ConnectionRegistry::send`] with the handle already resolved.
    pub async fn send_to(&self, handle: &Arc<ConnectionHandle>, bytes: Vec<u8>) -> SendOutcome {
        if handle.closed.is_cancelled() {
            return SendOutcome::Gone;
        }
        match handle.outbound.try_send(Outbound::Frame(bytes)) {
            Ok(()) => {
                handle.send_seq.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Ok
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %handle.id, "outbound buffer over high-watermark");
                self.close(handle.id, CloseReason::SlowConsumer).await;
                SendOutcome::Gone
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Gone,
        }
    }

    /// Broadcast to every live agent connection matching `pred`.
    pub async fn broadcast_to_agents<F>(&self, pred: F, bytes: &[u8])
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        self.broadcast(ConnectionKind::Agent, pred, bytes, None).await;
    }

    /// Broadcast to every subscribed dashboard, optionally excluding one
    /// connection (typically the requester, which gets a direct reply).
    pub async fn broadcast_to_dashboards<F>(&self, pred: F, bytes: &[u8], exclude: Option<Uuid>)
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        self.broadcast(ConnectionKind::Dashboard, pred, bytes, exclude).await;
    }

    async fn broadcast<F>(&self, kind: ConnectionKind, pred: F, bytes: &[u8], exclude: Option<Uuid>)
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let conns = self.conns.read().await;
            conns
                .values()
                .filter(|c| c.kind == kind && Some(c.id) != exclude)
                .map(Arc::clone)
                .collect()
        };
        for handle in targets {
            // Skip sockets already tearing down; per-connection failures are
            // absorbed (send_to schedules the teardown itself).
            if handle.closed.is_cancelled() || !pred(&handle) {
                continue;
            }
            let _ = self.send_to(&handle, bytes.to_vec()).await;
        }
    }

    /// Dashboards currently subscribed to an agent, optionally excluding
    /// one connection (a requester that gets a direct reply instead).
    pub async fn broadcast_to_subscribers(
        &self,
        agent_id: Uuid,
        bytes: &[u8],
        exclude: Option<Uuid>,
    ) {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let conns = self.conns.read().await;
            conns
                .values()
                .filter(|c| {
                    c.kind == ConnectionKind::Dashboard
                        && !c.closed.is_cancelled()
                        && Some(c.id) != exclude
                })
                .map(Arc::clone)
                .collect()
        };
        for handle in targets {
            if handle.subscriptions.read().await.contains(&agent_id) {
                let _ = self.send_to(&handle, bytes.to_vec()).await;
            }
        }
    }

    /// Close a connection. Idempotent: later calls are no-ops.
    pub async fn close(&self, conn_id: Uuid, reason: CloseReason) {
        let Some(handle) = self.conns.write().await.remove(&conn_id) else {
            return;
        };
        if handle.closed.is_cancelled() {
            return;
        }
        *handle.close_reason.lock() = Some(reason);
        // Best-effort close frame; the writer stops after it.
        let _ = handle.outbound.try_send(Outbound::Close(reason.code(), reason.as_str()));
        handle.closed.cancel();

        if let Some(agent) = handle.agent_id {
            let mut by_agent = self.by_agent.write().await;
            // Only unbind if this connection is still the live one; a
            // superseding connection may already have taken the slot.
            if by_agent.get(&agent) == Some(&conn_id) {
                by_agent.remove(&agent);
            }
        }
        tracing::debug!(conn = %conn_id, reason = %reason, "connection closed");
    }

    /// Close everything (server shutdown).
    pub async fn close_all(&self, reason: CloseReason) {
        let ids: Vec<Uuid> = self.conns.read().await.keys().copied().collect();
        for id in ids {
            self.close(id, reason).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
