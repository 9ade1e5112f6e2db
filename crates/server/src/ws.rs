// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoints: `/ws/agent` and `/ws/dashboard`.
//!
//! Each connection runs one select loop over its socket, its outbound
//! queue, and the transport ping timer. Frames route to the directory,
//! router, heartbeat tracker, and audit according to the catalogue.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use onsembl_protocol::messages::{
    AgentStatusUpdate, ConnectionAck, ControlAction, ErrorMessage, Message, Pong,
};
use onsembl_protocol::{AgentStatus, DecodeError, Frame, PROTOCOL_VERSION};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind};
use crate::auth::bearer_from_headers;
use crate::error::{CloseReason, ErrorCode};
use crate::registry::{ConnectionHandle, ConnectionKind, Outbound};
use crate::state::Store;

/// Deadline for the identifying first frame after upgrade.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Features advertised in `connection:ack`.
const SERVER_FEATURES: [&str; 4] =
    ["command-queue", "emergency-stop", "token-refresh", "output-replay"];

/// Build the axum application.
pub fn app(store: Arc<Store>) -> axum::Router {
    axum::Router::new()
        .route("/api/v1/health", get(health))
        .route("/ws/agent", get(ws_agent))
        .route("/ws/dashboard", get(ws_dashboard))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(store)
}

async fn health(State(store): State<Arc<Store>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "running",
        "version": PROTOCOL_VERSION,
        "connections": store.registry.len().await,
        "agents": store.directory.snapshot().await.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct AgentQueryParams {
    #[serde(rename = "agentId")]
    agent_id: Option<Uuid>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DashboardQueryParams {
    token: Option<String>,
}

async fn ws_agent(
    State(store): State<Arc<Store>>,
    Query(params): Query<AgentQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let presented =
        params.token.clone().or_else(|| bearer_from_headers(&headers).map(str::to_owned));
    ws.on_upgrade(move |socket| run_agent_connection(store, socket, params.agent_id, presented))
}

async fn ws_dashboard(
    State(store): State<Arc<Store>>,
    Query(params): Query<DashboardQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let presented =
        params.token.clone().or_else(|| bearer_from_headers(&headers).map(str::to_owned));
    ws.on_upgrade(move |socket| run_dashboard_connection(store, socket, presented))
}

type WsSink = SplitSink<WebSocket, WsMessage>;

fn encode_text(message: Message) -> Option<String> {
    match Frame::authored(message).encode() {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(e) => {
            tracing::error!(err = %e, "authored frame failed to encode");
            None
        }
    }
}

async fn send_message(tx: &mut WsSink, message: Message) -> Result<(), ()> {
    let Some(text) = encode_text(message) else {
        return Err(());
    };
    tx.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

async fn send_close(tx: &mut WsSink, code: u16, reason: &'static str) {
    let _ = tx.send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

fn protocol_error(err: &DecodeError) -> Message {
    Message::Error(ErrorMessage {
        code: ErrorCode::Protocol.as_str().to_owned(),
        message: err.to_string(),
        recoverable: err.recoverable(),
    })
}

/// Details map for audit entries, lifted from the raw connect payload so
/// redaction sees exactly what the peer sent.
fn payload_details(frame: &Frame) -> std::collections::BTreeMap<String, serde_json::Value> {
    frame
        .raw_payload()
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// agent connections
// ---------------------------------------------------------------------------

async fn run_agent_connection(
    store: Arc<Store>,
    socket: WebSocket,
    query_agent_id: Option<Uuid>,
    presented_token: Option<String>,
) {
    let (mut tx, mut rx) = socket.split();

    if store.tokens.enabled().await {
        let ok = match presented_token {
            Some(ref token) => store.tokens.validate(token).await,
            None => false,
        };
        if !ok {
            send_close(&mut tx, CloseReason::AuthFailed.code(), CloseReason::AuthFailed.as_str())
                .await;
            return;
        }
    }

    // First frame must be agent:connect, within the connect deadline.
    let first = tokio::time::timeout(CONNECT_DEADLINE, rx.next()).await;
    let frame = match first {
        Ok(Some(Ok(WsMessage::Text(text)))) => match Frame::decode(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = send_message(&mut tx, protocol_error(&e)).await;
                send_close(&mut tx, CloseReason::AuthFailed.code(), "handshake failed").await;
                return;
            }
        },
        _ => {
            send_close(&mut tx, CloseReason::AuthFailed.code(), "handshake timeout").await;
            return;
        }
    };
    let details = payload_details(&frame);
    let connect = match frame.message {
        Message::AgentConnect(ref c) => c.clone(),
        _ => {
            send_close(&mut tx, CloseReason::AuthFailed.code(), "expected agent:connect").await;
            return;
        }
    };
    if query_agent_id.is_some_and(|q| q != connect.agent_id) {
        send_close(&mut tx, CloseReason::AuthFailed.code(), "agentId mismatch").await;
        return;
    }

    let agent_id = connect.agent_id;
    let epoch = store.directory.upsert_connect(&connect).await;
    let (handle, outbound_rx) = store
        .registry
        .accept(ConnectionKind::Agent, connect.agent_name.clone(), Some(agent_id))
        .await;

    store.audit.record(
        AuditEntry::new(AuditKind::AgentConnect)
            .with_agent(agent_id)
            .with_detail("connection", handle.id.to_string())
            .with_details_map(details),
    );

    let ack = Message::ConnectionAck(ConnectionAck {
        connection_id: handle.id,
        server_version: env!("CARGO_PKG_VERSION").to_owned(),
        features: SERVER_FEATURES.iter().map(|s| (*s).to_string()).collect(),
    });
    if send_message(&mut tx, ack).await.is_err() {
        store.registry.close(handle.id, CloseReason::Normal).await;
        return;
    }

    store.router.broadcast_agent_status(agent_id).await;
    store.router.on_agent_connected(agent_id).await;

    let close_code =
        connection_loop(&store, &handle, outbound_rx, &mut tx, &mut rx, Some(agent_id)).await;

    store.registry.close(handle.id, CloseReason::Normal).await;
    store.audit.record(
        AuditEntry::new(AuditKind::AgentDisconnect)
            .with_agent(agent_id)
            .with_detail("connection", handle.id.to_string()),
    );
    store
        .router
        .on_agent_disconnected(agent_id, close_code == Some(CloseReason::SlowConsumer.code()))
        .await;
    store.heartbeats.forget(agent_id).await;

    // Offline grace: unless a new session takes over, dashboards see the
    // agent go offline after the window.
    let grace = store.config.offline_grace();
    let store_for_grace = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if store_for_grace.directory.set_offline_if_epoch(agent_id, epoch).await {
            store_for_grace.router.broadcast_agent_status(agent_id).await;
        }
    });
}

// ---------------------------------------------------------------------------
// dashboard connections
// ---------------------------------------------------------------------------

async fn run_dashboard_connection(
    store: Arc<Store>,
    socket: WebSocket,
    presented_token: Option<String>,
) {
    let (mut tx, mut rx) = socket.split();

    // The token may arrive via query/header or in dashboard:connect.
    let mut authed = match presented_token {
        Some(ref token) => store.tokens.validate(token).await,
        None => !store.tokens.enabled().await,
    };

    // First frame must be dashboard:connect, within the connect deadline.
    let first = tokio::time::timeout(CONNECT_DEADLINE, rx.next()).await;
    let frame = match first {
        Ok(Some(Ok(WsMessage::Text(text)))) => match Frame::decode(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = send_message(&mut tx, protocol_error(&e)).await;
                send_close(&mut tx, CloseReason::AuthFailed.code(), "handshake failed").await;
                return;
            }
        },
        _ => {
            send_close(&mut tx, CloseReason::AuthFailed.code(), "handshake timeout").await;
            return;
        }
    };
    let details = payload_details(&frame);
    let connect = match frame.message {
        Message::DashboardConnect(ref c) => c.clone(),
        _ => {
            send_close(&mut tx, CloseReason::AuthFailed.code(), "expected dashboard:connect").await;
            return;
        }
    };
    if !authed {
        authed = store.tokens.validate(&connect.token).await;
    }
    if !authed {
        send_close(&mut tx, CloseReason::AuthFailed.code(), CloseReason::AuthFailed.as_str()).await;
        return;
    }

    let principal = connect.client_info.clone().unwrap_or_else(|| "dashboard".to_owned());
    let (handle, outbound_rx) =
        store.registry.accept(ConnectionKind::Dashboard, principal.clone(), None).await;

    store.audit.record(
        AuditEntry::new(AuditKind::UserLogin)
            .with_user(principal.clone())
            .with_detail("connection", handle.id.to_string())
            .with_details_map(details),
    );

    let ack = Message::ConnectionAck(ConnectionAck {
        connection_id: handle.id,
        server_version: env!("CARGO_PKG_VERSION").to_owned(),
        features: SERVER_FEATURES.iter().map(|s| (*s).to_string()).collect(),
    });
    if send_message(&mut tx, ack).await.is_err() {
        store.registry.close(handle.id, CloseReason::Normal).await;
        return;
    }
    let list = Message::AgentList(onsembl_protocol::messages::AgentList {
        agents: store.directory.snapshot().await,
    });
    let _ = send_message(&mut tx, list).await;

    let _close_code = connection_loop(&store, &handle, outbound_rx, &mut tx, &mut rx, None).await;

    store.registry.close(handle.id, CloseReason::Normal).await;
    store.audit.record(
        AuditEntry::new(AuditKind::UserLogout)
            .with_user(principal)
            .with_detail("connection", handle.id.to_string()),
    );
}

// ---------------------------------------------------------------------------
// shared select loop
// ---------------------------------------------------------------------------

/// Run the per-connection select loop until the socket or the server gives
/// up. Returns the close code written to the peer, if any.
async fn connection_loop(
    store: &Arc<Store>,
    handle: &Arc<ConnectionHandle>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<Outbound>,
    tx: &mut WsSink,
    rx: &mut futures_util::stream::SplitStream<WebSocket>,
    agent_id: Option<Uuid>,
) -> Option<u16> {
    let mut ping_timer = tokio::time::interval(store.config.heartbeat_interval());
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await; // first tick is immediate
    let mut violations: u32 = 0;

    loop {
        tokio::select! {
            _ = store.shutdown.cancelled() => {
                send_close(tx, CloseReason::Normal.code(), "server shutdown").await;
                return Some(CloseReason::Normal.code());
            }
            _ = handle.closed.cancelled() => {
                // Closed from the registry side. The close frame may not
                // have fit into a full buffer (slow-consumer), so the
                // handle's recorded reason is authoritative.
                while let Ok(out) = outbound_rx.try_recv() {
                    if let Outbound::Close(code, reason) = out {
                        send_close(tx, code, reason).await;
                        return Some(code);
                    }
                }
                if let Some(reason) = handle.close_reason() {
                    send_close(tx, reason.code(), reason.as_str()).await;
                    return Some(reason.code());
                }
                return None;
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound::Frame(bytes)) => {
                        let Ok(text) = String::from_utf8(bytes) else { continue };
                        if tx.send(WsMessage::Text(text.into())).await.is_err() {
                            return None;
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        send_close(tx, code, reason).await;
                        return Some(code);
                    }
                    None => return None,
                }
            }
            _ = ping_timer.tick() => {
                if handle.since_last_pong()
                    > store.config.heartbeat_interval() + store.config.pong_timeout()
                {
                    store.registry.close(handle.id, CloseReason::HeartbeatTimeout).await;
                    send_close(
                        tx,
                        CloseReason::HeartbeatTimeout.code(),
                        CloseReason::HeartbeatTimeout.as_str(),
                    )
                    .await;
                    return Some(CloseReason::HeartbeatTimeout.code());
                }
                if tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return None;
                }
            }
            msg = rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => return None,
                };
                match msg {
                    WsMessage::Text(text) => {
                        match Frame::decode(text.as_bytes()) {
                            Ok(frame) => {
                                violations = 0;
                                if let Some(reply) =
                                    handle_frame(store, handle, agent_id, frame).await
                                {
                                    if send_message(tx, reply).await.is_err() {
                                        return None;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(conn = %handle.id, err = %e, "protocol violation");
                                violations += 1;
                                let _ = send_message(tx, protocol_error(&e)).await;
                                if violations >= store.config.protocol_violation_limit {
                                    store.registry.close(handle.id, CloseReason::AuthFailed).await;
                                    send_close(
                                        tx,
                                        CloseReason::AuthFailed.code(),
                                        "protocol violation rate",
                                    )
                                    .await;
                                    return Some(CloseReason::AuthFailed.code());
                                }
                            }
                        }
                    }
                    WsMessage::Pong(_) => handle.note_pong(),
                    WsMessage::Ping(payload) => {
                        let _ = tx.send(WsMessage::Pong(payload)).await;
                    }
                    WsMessage::Close(_) => return None,
                    WsMessage::Binary(_) => {
                        violations += 1;
                        let err = DecodeError::Invalid {
                            kind: "frame",
                            reason: "binary frames are not part of the protocol".to_owned(),
                        };
                        let _ = send_message(tx, protocol_error(&err)).await;
                    }
                }
            }
        }
    }
}

/// Route one decoded frame. Returns an immediate reply, if any.
async fn handle_frame(
    store: &Arc<Store>,
    handle: &Arc<ConnectionHandle>,
    agent_id: Option<Uuid>,
    frame: Frame,
) -> Option<Message> {
    match (&frame.message, agent_id) {
        // -- both directions ------------------------------------------------
        (Message::Ping(_), _) => return Some(Message::Pong(Pong {})),
        (Message::Pong(_), _) => {
            handle.note_pong();
        }
        (Message::Ack(_), _) => {}

        // -- wrapper → server ----------------------------------------------
        (Message::AgentStatus(update), Some(bound)) => {
            if update.agent_id != bound {
                return Some(reject("agent may only report its own status"));
            }
            let status = update.status;
            store.directory.set_status(bound, status).await;
            // A connecting report mid-session means the child is being
            // respawned.
            if status == AgentStatus::Connecting {
                store.directory.bump_restart_count(bound).await;
            }
            store.router.broadcast_agent_status(bound).await;
            if status == AgentStatus::Ready {
                store.router.maybe_dispatch(bound).await;
            }
        }
        (Message::AgentHeartbeat(beat), Some(bound)) => {
            if beat.agent_id != bound {
                return Some(reject("heartbeat for a different agent"));
            }
            store.heartbeats.note(beat).await;
            store.directory.touch(bound).await;
            if let Some(record) = store.directory.get(bound).await {
                let update = Message::AgentStatus(AgentStatusUpdate {
                    agent_id: bound,
                    agent_type: record.kind,
                    status: record.status,
                    capabilities: None,
                    metadata: serde_json::to_value(&beat.health_metrics).ok(),
                });
                if let Some(text) = encode_text(update) {
                    store
                        .registry
                        .broadcast_to_subscribers(bound, text.as_bytes(), None)
                        .await;
                }
            }
        }
        (Message::TerminalOutput(chunk), Some(bound)) => {
            if chunk.agent_id != bound {
                return Some(reject("output for a different agent"));
            }
            store.router.on_output(bound, &frame, chunk).await;
        }
        (Message::CommandComplete(done), Some(bound)) => {
            if done.agent_id != bound {
                return Some(reject("completion for a different agent"));
            }
            store.router.on_complete(bound, done).await;
        }
        (Message::AgentError(err), Some(bound)) => {
            if err.agent_id != bound {
                return Some(reject("error report for a different agent"));
            }
            store.audit.record(
                AuditEntry::new(AuditKind::AgentError)
                    .with_agent(bound)
                    .with_detail("code", err.code.clone())
                    .with_detail("message", err.message.clone()),
            );
            if let Some(text) = encode_text(frame.message.clone()) {
                store.registry.broadcast_to_subscribers(bound, text.as_bytes(), None).await;
            }
        }

        // -- dashboard → server --------------------------------------------
        (Message::DashboardSubscribe(sub), None) => {
            let agent_ids = sub.agent_ids.clone();
            {
                let mut subs = handle.subscriptions.write().await;
                if sub.all {
                    subs.all = true;
                }
                subs.agent_ids.extend(agent_ids.iter().copied());
            }
            // Current queue state for each newly subscribed agent.
            for id in agent_ids {
                let snapshot = store.router.queue_snapshot(id).await;
                if let Some(text) = encode_text(Message::CommandQueue(snapshot)) {
                    let _ = store.registry.send(handle.id, text.into_bytes()).await;
                }
            }
        }
        (Message::CommandRequest(request), None) => {
            let request = request.clone();
            if let Err(e) =
                store.router.submit(request, Some(handle.id), &handle.principal).await
            {
                return Some(Message::Error(ErrorMessage {
                    code: ErrorCode::AgentUnavailable.as_str().to_owned(),
                    message: e.message().to_owned(),
                    recoverable: true,
                }));
            }
        }
        (Message::CommandInterrupt(interrupt), None) => {
            if !store.router.interrupt(interrupt.command_id, interrupt.reason.clone()).await {
                return Some(Message::Error(ErrorMessage {
                    code: ErrorCode::Command.as_str().to_owned(),
                    message: "unknown command".to_owned(),
                    recoverable: true,
                }));
            }
        }
        (Message::AgentControl(control), None) => {
            // Dashboards use agent:control{stop} as the emergency stop; the
            // nil agent id means "all agents".
            match control.action {
                ControlAction::Stop => {
                    let scope = if control.agent_id.is_nil() {
                        None
                    } else {
                        Some(vec![control.agent_id])
                    };
                    store.router.emergency_stop(scope, &handle.principal).await;
                }
                ControlAction::Restart => {
                    let target = control.agent_id;
                    if let Some(conn) = store.registry.agent_connection(target).await {
                        if let Some(text) = encode_text(frame.message.clone()) {
                            let _ = store.registry.send_to(&conn, text.into_bytes()).await;
                        }
                    }
                }
            }
        }

        // Anything else is a direction violation.
        _ => {
            return Some(reject("message not valid in this direction"));
        }
    }
    None
}

fn reject(message: &str) -> Message {
    Message::Error(ErrorMessage {
        code: ErrorCode::Protocol.as_str().to_owned(),
        message: message.to_owned(),
        recoverable: true,
    })
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
