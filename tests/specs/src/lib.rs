// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end harness: an in-process server, an in-process wrapper
//! supervising a scripted agent, and real WebSocket dashboards.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use onsembl_protocol::messages::{DashboardConnect, DashboardSubscribe, Message};
use onsembl_protocol::{AgentKind, Frame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use onsembl_agent::config::Config as AgentConfig;
use onsembl_agent::credential::{CredentialStore, FileCredentialStore};
use onsembl_agent::heartbeat::MetricsState;
use onsembl_agent::session::{AgentIdentity, Session, SessionEnd};
use onsembl_agent::supervisor::{Supervisor, SupervisorExit};
use onsembl_server::config::Config as ServerConfig;
use onsembl_server::run;
use onsembl_server::state::Store;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An in-process server plus direct access to its store.
pub struct SpecServer {
    pub addr: SocketAddr,
    pub store: Arc<Store>,
    pub shutdown: CancellationToken,
    _data_dir: Option<tempfile::TempDir>,
}

impl SpecServer {
    /// Start with fast test timers and a scratch data dir.
    pub async fn start() -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let config = ServerConfig::for_tests(Some(data_dir.path().to_path_buf()));
        let shutdown = CancellationToken::new();
        let store = Store::new(config, shutdown.clone());
        let (addr, _task) = run::start(Arc::clone(&store)).await?;
        Ok(Self { addr, store, shutdown, _data_dir: Some(data_dir) })
    }
}

impl Drop for SpecServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An in-process wrapper (supervisor + session) around a scripted agent.
pub struct SpecAgent {
    pub agent_id: Uuid,
    pub child_pid: Arc<AtomicU32>,
    pub shutdown: CancellationToken,
    pub session_task: tokio::task::JoinHandle<SessionEnd>,
    pub supervisor_task: tokio::task::JoinHandle<SupervisorExit>,
    _state_dir: tempfile::TempDir,
}

impl SpecAgent {
    /// Start a wrapper for the given executable script and kind.
    pub async fn start(server: &SpecServer, command: &str, kind: AgentKind) -> anyhow::Result<Self> {
        let state_dir = tempfile::tempdir()?;
        let store = FileCredentialStore::new(state_dir.path());
        store.store("spec-token")?;

        let config = AgentConfig::try_parse_from([
            "onsembl-agent",
            "--command",
            command,
            "--type",
            kind.as_str(),
            "--server-url",
            &format!("ws://{}", server.addr),
            "--reconnect-base-delay-ms",
            "100",
            "--heartbeat-interval-ms",
            "500",
            "--output-flush-interval-ms",
            "20",
        ])?;

        let agent_id = Uuid::new_v4();
        let shutdown = CancellationToken::new();
        let child_pid = Arc::new(AtomicU32::new(0));
        let metrics = MetricsState::new(Arc::clone(&child_pid));
        let (events_tx, events_rx) = mpsc::channel(256);
        let (directives_tx, directives_rx) = mpsc::channel(16);

        let supervisor = Supervisor::new(
            config.clone(),
            kind,
            events_tx,
            shutdown.clone(),
            Arc::clone(&child_pid),
        );
        let supervisor_task = tokio::spawn(supervisor.run(directives_rx));

        let credentials: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::new(state_dir.path()));
        let session = Session::new(
            config,
            AgentIdentity { agent_id, agent_name: format!("spec-{agent_id}"), kind },
            credentials,
            directives_tx,
            metrics,
            shutdown.clone(),
        );
        let session_task = tokio::spawn(session.run(events_rx));

        Ok(Self {
            agent_id,
            child_pid,
            shutdown,
            session_task,
            supervisor_task,
            _state_dir: state_dir,
        })
    }

    /// PID of the currently running child, once there is one.
    pub async fn wait_child_pid(&self) -> anyhow::Result<u32> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let pid = self.child_pid.load(Ordering::Acquire);
            if pid != 0 {
                return Ok(pid);
            }
            anyhow::ensure!(tokio::time::Instant::now() < deadline, "child never spawned");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for SpecAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Write an executable script into `dir` and return its path.
pub fn script(dir: &Path, name: &str, body: &str) -> anyhow::Result<String> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Connect a dashboard, complete the handshake, and subscribe to an agent.
pub async fn dashboard(server: &SpecServer, subscribe_to: &[Uuid]) -> anyhow::Result<Ws> {
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws/dashboard", server.addr)).await?;
    send(
        &mut ws,
        Message::DashboardConnect(DashboardConnect {
            token: "T".to_owned(),
            client_info: Some("spec-dashboard".to_owned()),
        }),
    )
    .await?;
    recv_until(&mut ws, |m| match m {
        Message::ConnectionAck(_) => Some(()),
        _ => None,
    })
    .await?;
    if !subscribe_to.is_empty() {
        send(
            &mut ws,
            Message::DashboardSubscribe(DashboardSubscribe {
                agent_ids: subscribe_to.to_vec(),
                all: false,
            }),
        )
        .await?;
    }
    Ok(ws)
}

pub async fn send(ws: &mut Ws, message: Message) -> anyhow::Result<()> {
    let bytes = Frame::authored(message).encode()?;
    ws.send(TgMessage::Text(String::from_utf8(bytes)?.into())).await?;
    Ok(())
}

/// Send a raw JSON frame (for payloads the typed catalogue would strip).
pub async fn send_raw(ws: &mut Ws, raw: serde_json::Value) -> anyhow::Result<()> {
    ws.send(TgMessage::Text(raw.to_string().into())).await?;
    Ok(())
}

/// Receive frames until `pick` matches.
pub async fn recv_until<T>(ws: &mut Ws, pick: impl Fn(&Message) -> Option<T>) -> anyhow::Result<T> {
    for _ in 0..256 {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        match msg {
            TgMessage::Text(text) => {
                let frame = Frame::decode(text.as_bytes())?;
                if let Some(found) = pick(&frame.message) {
                    return Ok(found);
                }
            }
            TgMessage::Close(frame) => anyhow::bail!("socket closed: {frame:?}"),
            _ => {}
        }
    }
    anyhow::bail!("expected frame never arrived")
}

/// Drain frames for `window`, returning everything that matched `pick`.
pub async fn collect_for<T>(
    ws: &mut Ws,
    window: Duration,
    pick: impl Fn(&Message) -> Option<T>,
) -> anyhow::Result<Vec<T>> {
    let deadline = tokio::time::Instant::now() + window;
    let mut out = vec![];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(out);
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(TgMessage::Text(text)))) => {
                let frame = Frame::decode(text.as_bytes())?;
                if let Some(found) = pick(&frame.message) {
                    out.push(found);
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => return Ok(out),
        }
    }
}
