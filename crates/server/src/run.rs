// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server composition and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use onsembl_protocol::messages::{Message, TokenRefresh};
use onsembl_protocol::Frame;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditKind};
use crate::config::Config;
use crate::error::CloseReason;
use crate::heartbeat::spawn_staleness_checker;
use crate::state::Store;
use crate::ws;

/// Bind the listener and serve until the store's shutdown token fires.
/// Returns the bound address and the serve task.
pub async fn start(
    store: Arc<Store>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener =
        tokio::net::TcpListener::bind((store.config.host.as_str(), store.config.port)).await?;
    let addr = listener.local_addr()?;
    let app = ws::app(Arc::clone(&store));
    let shutdown = store.shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) =
            axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await
        {
            tracing::error!(err = %e, "server task failed");
        }
    });
    Ok((addr, task))
}

/// Full server lifecycle: compose, sweep, serve, drain.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let store = Store::new(config, shutdown.clone());

    // One-time sweep: commands left in flight by a previous run become
    // failed{shutdown} in the audit trail.
    let swept = store.audit.sweep_unfinished().await;
    if !swept.is_empty() {
        tracing::info!(count = swept.len(), "reconstituted in-flight commands as failed");
    }

    spawn_staleness_checker(
        Arc::clone(&store.heartbeats),
        Arc::clone(&store.directory),
        Arc::clone(&store.registry),
        store.config.heartbeat_interval(),
        shutdown.clone(),
    );
    spawn_token_rotation(Arc::clone(&store));
    spawn_retention_sweep(Arc::clone(&store));

    let (addr, serve_task) = start(Arc::clone(&store)).await?;
    tracing::info!(addr = %addr, "onsembl server listening");

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrl_c_shutdown.cancel();
        }
    });

    shutdown.cancelled().await;

    // Drain: in-flight commands fail with shutdown, connections close,
    // and the audit funnel flushes before exit.
    store.router.drain_for_shutdown().await;
    store.registry.close_all(CloseReason::Normal).await;
    store.audit.flush().await;
    let _ = serve_task.await;
    Ok(())
}

/// Rotate the accepted bearer token on a timer, pushing `token:refresh`
/// to every live connection so nobody has to reconnect.
fn spawn_token_rotation(store: Arc<Store>) {
    let interval_ms = store.config.token_rotate_interval_ms;
    if interval_ms == 0 {
        return;
    }
    tokio::spawn(async move {
        let period = std::time::Duration::from_millis(interval_ms);
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = store.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            if !store.tokens.enabled().await {
                continue;
            }
            let fresh = store.tokens.rotate().await;
            let refresh = Message::TokenRefresh(TokenRefresh {
                access_token: fresh,
                expires_in: (interval_ms * 2) / 1000,
            });
            let Ok(bytes) = Frame::authored(refresh).encode() else {
                continue;
            };
            store.registry.broadcast_to_agents(|_| true, &bytes).await;
            store.registry.broadcast_to_dashboards(|_| true, &bytes, None).await;
            store
                .audit
                .record(AuditEntry::new(AuditKind::ConfigChange).with_detail("change", "token-rotated"));

            // Let stragglers finish in-flight reconnects on the old token.
            tokio::time::sleep(period / 2).await;
            store.tokens.expire_previous().await;
        }
    });
}

/// Daily archival pass over the audit log. Queries already enforce the
/// retention cut; this just keeps the live file from growing unbounded.
fn spawn_retention_sweep(store: Arc<Store>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = store.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let archived = store.audit.archive_expired().await;
            if archived > 0 {
                tracing::info!(archived, "archived expired audit entries");
            }
        }
    });
}
