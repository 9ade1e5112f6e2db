// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane session: the wrapper's single outbound connection.
//!
//! Reconnection is delegated to the backoff + circuit breaker pair in
//! [`crate::reconnect`]. Auth failures get one credential-store refresh
//! before the wrapper gives up with a user-actionable message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use onsembl_protocol::messages::{
    AgentCapabilities, AgentConnect, AgentError, AgentHeartbeat, AgentStatusUpdate,
    CommandComplete, HostMachine, Message, Pong, TerminalOutput,
};
use onsembl_protocol::{close_code, AgentKind, Frame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::credential::CredentialStore;
use crate::error::AUTH_HINT;
use crate::heartbeat::MetricsState;
use crate::reconnect::{Backoff, CircuitBreaker};
use crate::supervisor::{Directive, WrapperEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Clean end: shutdown requested or the supervisor finished.
    Closed,
    /// Authentication failed even after a refresh attempt.
    AuthRequired,
    /// Reconnect budget exhausted.
    TransportExhausted,
}

/// Identity the session announces in `agent:connect`.
pub struct AgentIdentity {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub kind: AgentKind,
}

enum Attempt {
    /// Connection served traffic and then dropped; retry.
    Dropped,
    /// Never connected; retry counts against the breaker.
    Failed,
    AuthFailed,
    Shutdown,
    SupervisorGone,
}

pub struct Session {
    config: Config,
    identity: AgentIdentity,
    credentials: Arc<dyn CredentialStore>,
    directives: mpsc::Sender<Directive>,
    metrics: Arc<MetricsState>,
    shutdown: CancellationToken,
    /// Dispatch time per in-flight command, for the response-time metric.
    inflight: HashMap<Uuid, Instant>,
}

impl Session {
    pub fn new(
        config: Config,
        identity: AgentIdentity,
        credentials: Arc<dyn CredentialStore>,
        directives: mpsc::Sender<Directive>,
        metrics: Arc<MetricsState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { config, identity, credentials, directives, metrics, shutdown, inflight: HashMap::new() }
    }

    /// Run the session until shutdown, auth failure, or transport exhaustion.
    pub async fn run(mut self, mut events: mpsc::Receiver<WrapperEvent>) -> SessionEnd {
        let mut backoff =
            Backoff::new(self.config.reconnect_base_delay(), self.config.reconnect_attempts);
        let mut breaker = CircuitBreaker::new();
        let mut auth_retried = false;

        loop {
            if self.shutdown.is_cancelled() {
                return SessionEnd::Closed;
            }
            if !breaker.can_attempt() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return SessionEnd::Closed,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }

            match self.attempt(&mut events).await {
                Attempt::Shutdown | Attempt::SupervisorGone => return SessionEnd::Closed,
                Attempt::AuthFailed => {
                    if auth_retried {
                        tracing::error!("authentication failed; {AUTH_HINT}");
                        return SessionEnd::AuthRequired;
                    }
                    auth_retried = true;
                    match self.credentials.refresh() {
                        Ok(Some(_)) => {
                            tracing::info!("credential refreshed, retrying connect");
                            continue;
                        }
                        _ => {
                            tracing::error!("authentication failed; {AUTH_HINT}");
                            return SessionEnd::AuthRequired;
                        }
                    }
                }
                Attempt::Dropped => {
                    breaker.on_success();
                    backoff.reset();
                    auth_retried = false;
                    // Immediate retry after a served connection drops; the
                    // next failures start the schedule from the base again.
                }
                Attempt::Failed => {
                    breaker.on_failure();
                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!("reconnect attempts exhausted");
                        return SessionEnd::TransportExhausted;
                    };
                    tracing::info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = backoff.attempts_made(),
                        "reconnect scheduled"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return SessionEnd::Closed,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connection attempt: dial, handshake, serve until drop.
    async fn attempt(&mut self, events: &mut mpsc::Receiver<WrapperEvent>) -> Attempt {
        let token = match self.credentials.get() {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::error!("no credential available; {AUTH_HINT}");
                return Attempt::AuthFailed;
            }
            Err(e) => {
                tracing::error!(err = %e, "credential store unreadable");
                return Attempt::AuthFailed;
            }
        };

        let url = format!(
            "{}/ws/agent?agentId={}&token={}",
            self.config.ws_url(),
            self.identity.agent_id,
            token
        );
        let mut request = match url.into_client_request() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(err = %e, "bad server url");
                return Attempt::Failed;
            }
        };
        if let Ok(value) = format!("Bearer {token}").parse() {
            request.headers_mut().insert("authorization", value);
        }

        let connected =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await;
        let mut ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response)))
                if response.status() == 401 || response.status() == 403 =>
            {
                return Attempt::AuthFailed;
            }
            Ok(Err(e)) => {
                tracing::warn!(err = %e, "connect failed");
                return Attempt::Failed;
            }
            Err(_) => {
                tracing::warn!("connect timed out");
                return Attempt::Failed;
            }
        };

        if self.send(&mut ws, self.connect_message()).await.is_err() {
            return Attempt::Failed;
        }

        // The server acks or closes (4003 on bad tokens).
        match tokio::time::timeout(CONNECT_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(TgMessage::Text(text)))) => match Frame::decode(text.as_bytes()) {
                Ok(frame) if matches!(frame.message, Message::ConnectionAck(_)) => {}
                Ok(frame) => {
                    tracing::warn!(kind = frame.message.kind().as_str(), "expected connection:ack");
                    return Attempt::Failed;
                }
                Err(e) => {
                    tracing::warn!(err = %e, "bad ack frame");
                    return Attempt::Failed;
                }
            },
            Ok(Some(Ok(TgMessage::Close(frame)))) => {
                let code = frame.map(|f| u16::from(f.code));
                if code == Some(close_code::AUTH_FAILED) {
                    return Attempt::AuthFailed;
                }
                return Attempt::Failed;
            }
            _ => return Attempt::Failed,
        }

        tracing::info!(agent_id = %self.identity.agent_id, "control-plane session established");
        self.serve(ws, events).await
    }

    /// Serve an established connection until it drops.
    async fn serve(&mut self, mut ws: Ws, events: &mut mpsc::Receiver<WrapperEvent>) -> Attempt {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws.close(None).await;
                    return Attempt::Shutdown;
                }
                incoming = ws.next() => {
                    let msg = match incoming {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            tracing::warn!(err = %e, "socket error");
                            return Attempt::Dropped;
                        }
                        None => return Attempt::Dropped,
                    };
                    match msg {
                        TgMessage::Text(text) => {
                            match Frame::decode(text.as_bytes()) {
                                Ok(frame) => {
                                    if !self.on_frame(&mut ws, frame).await {
                                        return Attempt::SupervisorGone;
                                    }
                                }
                                // The client side ignores frames it cannot
                                // decode; unknown types especially must not
                                // kill the connection.
                                Err(e) => tracing::warn!(err = %e, "ignoring undecodable frame"),
                            }
                        }
                        TgMessage::Close(frame) => {
                            let code = frame.map(|f| u16::from(f.code));
                            tracing::info!(code = ?code, "server closed connection");
                            if code == Some(close_code::AUTH_FAILED) {
                                return Attempt::AuthFailed;
                            }
                            return Attempt::Dropped;
                        }
                        // tungstenite answers pings on its own.
                        _ => {}
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        let _ = ws.close(None).await;
                        return Attempt::SupervisorGone;
                    };
                    if self.on_event(&mut ws, event).await.is_err() {
                        return Attempt::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Message::AgentHeartbeat(AgentHeartbeat {
                        agent_id: self.identity.agent_id,
                        health_metrics: self.metrics.collect(),
                    });
                    if self.send(&mut ws, beat).await.is_err() {
                        return Attempt::Dropped;
                    }
                }
            }
        }
    }

    /// Handle one server frame. Returns false when the supervisor is gone.
    async fn on_frame(&mut self, ws: &mut Ws, frame: Frame) -> bool {
        match frame.message {
            Message::CommandRequest(request) => {
                self.inflight.insert(request.command_id, Instant::now());
                if self.directives.send(Directive::Execute(request)).await.is_err() {
                    return false;
                }
            }
            Message::CommandInterrupt(interrupt) => {
                let directive = Directive::Interrupt {
                    command_id: interrupt.command_id,
                    reason: interrupt.reason,
                };
                if self.directives.send(directive).await.is_err() {
                    return false;
                }
            }
            Message::AgentControl(control) => {
                if control.agent_id == self.identity.agent_id || control.agent_id.is_nil() {
                    if self.directives.send(Directive::Control(control.action)).await.is_err() {
                        return false;
                    }
                }
            }
            Message::TokenRefresh(refresh) => {
                // Swap the stored token in place; no reconnect needed.
                if let Err(e) = self.credentials.store(&refresh.access_token) {
                    tracing::warn!(err = %e, "failed to persist refreshed token");
                }
            }
            Message::Ping(_) => {
                let _ = self.send(ws, Message::Pong(Pong {})).await;
            }
            Message::Error(err) => {
                tracing::warn!(code = %err.code, message = %err.message, "server error frame");
            }
            other => {
                tracing::debug!(kind = other.kind().as_str(), "ignoring frame");
            }
        }
        true
    }

    /// Translate one supervisor event into protocol traffic.
    async fn on_event(&mut self, ws: &mut Ws, event: WrapperEvent) -> Result<(), ()> {
        match event {
            WrapperEvent::Status { state, cause } => {
                tracing::debug!(state = state.as_str(), cause, "reporting status");
                let update = Message::AgentStatus(AgentStatusUpdate {
                    agent_id: self.identity.agent_id,
                    agent_type: self.identity.kind,
                    status: state.wire_status(),
                    capabilities: None,
                    metadata: None,
                });
                self.send(ws, update).await
            }
            WrapperEvent::Output { command_id, stream, sequence, chunk } => {
                let output = Message::TerminalOutput(TerminalOutput {
                    command_id,
                    agent_id: self.identity.agent_id,
                    data: chunk.data,
                    stream,
                    sequence,
                    ansi_codes: chunk.ansi_codes,
                    is_blank: chunk.is_blank,
                    is_binary: chunk.is_binary,
                });
                self.send(ws, output).await
            }
            WrapperEvent::Completed { command_id, exit_code, interrupted, error } => {
                if let Some(started) = self.inflight.remove(&command_id) {
                    self.metrics.note_command(started.elapsed());
                }
                let complete = Message::CommandComplete(CommandComplete {
                    command_id,
                    agent_id: self.identity.agent_id,
                    exit_code,
                    interrupted,
                    error,
                });
                self.send(ws, complete).await
            }
            WrapperEvent::Fault { code, message } => {
                let fault = Message::AgentError(AgentError {
                    agent_id: self.identity.agent_id,
                    code,
                    message,
                });
                self.send(ws, fault).await
            }
        }
    }

    fn connect_message(&self) -> Message {
        Message::AgentConnect(AgentConnect {
            agent_id: self.identity.agent_id,
            agent_type: self.identity.kind,
            agent_name: self.identity.agent_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            host_machine: HostMachine { hostname: hostname(), pid: Some(std::process::id()) },
            capabilities: AgentCapabilities {
                max_tokens: self.config.max_tokens,
                supports_interrupt: true,
                supports_trace: false,
            },
        })
    }

    async fn send(&self, ws: &mut Ws, message: Message) -> Result<(), ()> {
        let bytes = Frame::authored(message).encode().map_err(|_| ())?;
        let text = String::from_utf8(bytes).map_err(|_| ())?;
        ws.send(TgMessage::Text(text.into())).await.map_err(|_| ())
    }
}

/// Best-effort hostname.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
