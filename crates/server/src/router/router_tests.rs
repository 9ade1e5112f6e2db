// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use onsembl_protocol::messages::{
    AgentCapabilities, AgentConnect, CommandComplete, CommandOptions, CommandRequest, HostMachine,
    Message, TerminalOutput,
};
use onsembl_protocol::{AgentKind, AgentStatus, CommandPriority, CommandState, Frame, StreamKind};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog, AuditQuery};
use crate::directory::AgentDirectory;
use crate::registry::{ConnectionKind, ConnectionRegistry, Outbound};

use super::{CommandRouter, RouterSettings, SubmitError};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct Rig {
    router: Arc<CommandRouter>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<AgentDirectory>,
    audit: AuditLog,
    _tmp: tempfile::TempDir,
}

async fn rig() -> anyhow::Result<Rig> {
    let tmp = tempfile::tempdir()?;
    let registry = Arc::new(ConnectionRegistry::new(64));
    let directory = Arc::new(AgentDirectory::open(None));
    let audit = AuditLog::open(Some(tmp.path()), Duration::from_secs(86_400));
    let router = CommandRouter::new(
        Arc::clone(&registry),
        Arc::clone(&directory),
        audit.clone(),
        RouterSettings {
            command_timeout: Duration::from_millis(400),
            interrupt_grace: Duration::from_millis(100),
        },
        None,
    );
    Ok(Rig { router, registry, directory, audit, _tmp: tmp })
}

impl Rig {
    /// Register a ready agent with a live connection; returns its id and
    /// the connection's outbound receiver.
    async fn ready_agent(&self) -> (Uuid, mpsc::Receiver<Outbound>) {
        let agent_id = Uuid::new_v4();
        self.directory
            .upsert_connect(&AgentConnect {
                agent_id,
                agent_type: AgentKind::Claude,
                agent_name: format!("agent-{agent_id}"),
                version: "0.3.0".to_owned(),
                host_machine: HostMachine { hostname: "devbox".to_owned(), pid: Some(1) },
                capabilities: AgentCapabilities::default(),
            })
            .await;
        self.directory.set_status(agent_id, AgentStatus::Ready).await;
        let (_, rx) =
            self.registry.accept(ConnectionKind::Agent, "wrapper".to_owned(), Some(agent_id)).await;
        (agent_id, rx)
    }

    /// A dashboard subscribed to one agent.
    async fn subscriber(&self, agent_id: Uuid) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (conn, rx) =
            self.registry.accept(ConnectionKind::Dashboard, "op".to_owned(), None).await;
        conn.subscriptions.write().await.agent_ids.insert(agent_id);
        (conn.id, rx)
    }
}

fn request(agent_id: Uuid, text: &str, priority: CommandPriority) -> CommandRequest {
    CommandRequest {
        command_id: Uuid::new_v4(),
        agent_id,
        command: text.to_owned(),
        args: vec![],
        options: CommandOptions::default(),
        priority,
    }
}

fn output(command_id: Uuid, agent_id: Uuid, sequence: u64, data: &str) -> TerminalOutput {
    TerminalOutput {
        command_id,
        agent_id,
        data: data.to_owned(),
        stream: StreamKind::Stdout,
        sequence,
        ansi_codes: None,
        is_blank: false,
        is_binary: false,
    }
}

async fn recv_frame(rx: &mut mpsc::Receiver<Outbound>) -> anyhow::Result<Frame> {
    loop {
        let out = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel closed"))?;
        match out {
            Outbound::Frame(bytes) => return Ok(Frame::decode(&bytes)?),
            Outbound::Close(..) => anyhow::bail!("unexpected close"),
        }
    }
}

/// Skip frames until one matches `pick`.
async fn recv_until<T>(
    rx: &mut mpsc::Receiver<Outbound>,
    pick: impl Fn(&Message) -> Option<T>,
) -> anyhow::Result<T> {
    for _ in 0..32 {
        let frame = recv_frame(rx).await?;
        if let Some(found) = pick(&frame.message) {
            return Ok(found);
        }
    }
    anyhow::bail!("expected frame never arrived")
}

#[tokio::test]
async fn submit_to_ready_agent_dispatches_immediately() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, mut agent_rx) = rig.ready_agent().await;
    let (dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let req = request(agent_id, "echo hi", CommandPriority::Normal);
    let command_id = req.command_id;
    rig.router.submit(req, Some(dash_id), "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    // The requester sees queued first.
    let status = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id => Some(s.clone()),
        _ => None,
    })
    .await?;
    assert_eq!(status.status, CommandState::Queued);

    // The agent receives the forwarded command:request.
    let forwarded = recv_until(&mut agent_rx, |m| match m {
        Message::CommandRequest(r) => Some(r.clone()),
        _ => None,
    })
    .await?;
    assert_eq!(forwarded.command_id, command_id);
    assert_eq!(forwarded.command, "echo hi");

    assert_eq!(rig.directory.status(agent_id).await, Some(AgentStatus::Busy));
    Ok(())
}

#[tokio::test]
async fn submit_rejects_unknown_and_stopping_agents() -> anyhow::Result<()> {
    let rig = rig().await?;
    let unknown = request(Uuid::new_v4(), "echo", CommandPriority::Normal);
    assert_eq!(rig.router.submit(unknown, None, "op").await, Err(SubmitError::UnknownAgent));

    let (agent_id, _agent_rx) = rig.ready_agent().await;
    rig.directory.set_status(agent_id, AgentStatus::Stopping).await;
    let req = request(agent_id, "echo", CommandPriority::Normal);
    assert_eq!(rig.router.submit(req, None, "op").await, Err(SubmitError::AgentStopping));
    Ok(())
}

#[tokio::test]
async fn output_emits_running_then_chunks_and_drops_duplicates() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let req = request(agent_id, "multiline", CommandPriority::Normal);
    let command_id = req.command_id;
    rig.router.submit(req, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    for seq in 1..=3u64 {
        let chunk = output(command_id, agent_id, seq, &format!("Line {seq}\n"));
        let frame = Frame::authored(Message::TerminalOutput(chunk.clone()));
        rig.router.on_output(agent_id, &frame, &chunk).await;
    }
    // Duplicate of seq 2: dropped.
    let dup = output(command_id, agent_id, 2, "Line 2\n");
    let dup_frame = Frame::authored(Message::TerminalOutput(dup.clone()));
    rig.router.on_output(agent_id, &dup_frame, &dup).await;

    // Running status precedes the first chunk.
    let running = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id => Some(s.status),
        _ => None,
    })
    .await?;
    assert_eq!(running, CommandState::Running);

    let mut sequences = vec![];
    for _ in 0..3 {
        let seq = recv_until(&mut dash_rx, |m| match m {
            Message::TerminalOutput(o) if o.command_id == command_id => Some(o.sequence),
            _ => None,
        })
        .await?;
        sequences.push(seq);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn completion_resolves_and_dispatches_next() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, mut agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let first = request(agent_id, "first", CommandPriority::Normal);
    let second = request(agent_id, "second", CommandPriority::Normal);
    let first_id = first.command_id;
    let second_id = second.command_id;
    rig.router.submit(first, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(second, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    rig.router
        .on_complete(
            agent_id,
            &CommandComplete {
                command_id: first_id,
                agent_id,
                exit_code: Some(0),
                interrupted: false,
                error: None,
            },
        )
        .await;

    let done = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == first_id && s.status.is_terminal() => {
            Some(s.clone())
        }
        _ => None,
    })
    .await?;
    assert_eq!(done.status, CommandState::Completed);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.execution_time_ms.is_some(), "server stamps executionTime");

    // The queue advances: the agent receives the second command.
    let mut seen = vec![];
    for _ in 0..2 {
        let got = recv_until(&mut agent_rx, |m| match m {
            Message::CommandRequest(r) => Some(r.command_id),
            _ => None,
        })
        .await?;
        seen.push(got);
    }
    assert_eq!(seen, vec![first_id, second_id]);
    Ok(())
}

#[tokio::test]
async fn interrupt_queued_command_cancels_it() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let running = request(agent_id, "long", CommandPriority::Normal);
    let queued = request(agent_id, "waiting", CommandPriority::Normal);
    let queued_id = queued.command_id;
    rig.router.submit(running, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(queued, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert!(rig.router.interrupt(queued_id, Some("changed my mind".to_owned())).await);

    let status = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == queued_id => Some(s.status),
        _ => None,
    })
    .await?;
    assert_eq!(status, CommandState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn unacknowledged_interrupt_force_fails_after_grace() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, mut agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let req = request(agent_id, "stuck", CommandPriority::Normal);
    let command_id = req.command_id;
    rig.router.submit(req, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert!(rig.router.interrupt(command_id, None).await);

    // The wrapper got command:interrupt but never acknowledges.
    let interrupt = recv_until(&mut agent_rx, |m| match m {
        Message::CommandInterrupt(i) => Some(i.command_id),
        _ => None,
    })
    .await?;
    assert_eq!(interrupt, command_id);

    let failed = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some(s.clone())
        }
        _ => None,
    })
    .await?;
    assert_eq!(failed.status, CommandState::Failed);
    assert_eq!(failed.error.as_deref(), Some("interrupt-timeout"));
    Ok(())
}

#[tokio::test]
async fn acknowledged_interrupt_resolves_interrupted() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let req = request(agent_id, "long", CommandPriority::Normal);
    let command_id = req.command_id;
    rig.router.submit(req, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert!(rig.router.interrupt(command_id, None).await);
    rig.router
        .on_complete(
            agent_id,
            &CommandComplete {
                command_id,
                agent_id,
                exit_code: None,
                interrupted: true,
                error: None,
            },
        )
        .await;

    let status = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some(s.status)
        }
        _ => None,
    })
    .await?;
    assert_eq!(status, CommandState::Interrupted);
    Ok(())
}

#[tokio::test]
async fn command_timeout_force_fails() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let mut req = request(agent_id, "sleepy", CommandPriority::Normal);
    req.options.timeout_ms = Some(50);
    let command_id = req.command_id;
    rig.router.submit(req, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    // A synthetic final chunk names the cause, then the terminal status.
    let synthetic = recv_until(&mut dash_rx, |m| match m {
        Message::TerminalOutput(o) if o.command_id == command_id => Some(o.clone()),
        _ => None,
    })
    .await?;
    assert!(synthetic.data.contains("timeout"));
    assert_eq!(synthetic.stream, StreamKind::Stderr);

    let failed = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some(s.clone())
        }
        _ => None,
    })
    .await?;
    assert_eq!(failed.status, CommandState::Failed);
    assert_eq!(failed.error.as_deref(), Some("timeout"));
    Ok(())
}

#[tokio::test]
async fn emergency_stop_cancels_everything_and_audits_once() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, mut agent_rx) = rig.ready_agent().await;

    let running = request(agent_id, "long", CommandPriority::Normal);
    let queued_one = request(agent_id, "q1", CommandPriority::Normal);
    let queued_two = request(agent_id, "q2", CommandPriority::Low);
    let running_id = running.command_id;
    rig.router.submit(running, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(queued_one, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(queued_two, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let report = rig.router.emergency_stop(None, "op").await;
    assert_eq!(report.interrupted, vec![running_id]);
    assert_eq!(report.cancelled.len(), 2);

    // The wrapper is told to stop.
    let control = recv_until(&mut agent_rx, |m| match m {
        Message::AgentControl(c) => Some(c.action),
        _ => None,
    })
    .await?;
    assert_eq!(control, onsembl_protocol::messages::ControlAction::Stop);

    // Exactly one emergency-stop audit entry.
    let entries = rig
        .audit
        .query(&AuditQuery { kind: Some(AuditKind::EmergencyStop), ..Default::default() })
        .await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].details.contains_key("cancelledCommands"));
    Ok(())
}

#[tokio::test]
async fn slow_consumer_drop_holds_queue_for_reconnect() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let running = request(agent_id, "long", CommandPriority::Normal);
    let held = request(agent_id, "held", CommandPriority::High);
    let running_id = running.command_id;
    let held_id = held.command_id;
    rig.router.submit(running, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(held, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    rig.router.on_agent_disconnected(agent_id, true).await;

    let failed = recv_until(&mut dash_rx, |m| match m {
        Message::CommandStatus(s) if s.command_id == running_id && s.status.is_terminal() => {
            Some(s.clone())
        }
        _ => None,
    })
    .await?;
    assert_eq!(failed.status, CommandState::Failed);
    assert_eq!(failed.error.as_deref(), Some("transport"));

    // Reconnect: the held command is re-enqueued and dispatched.
    rig.directory.set_status(agent_id, AgentStatus::Ready).await;
    let (_, mut new_agent_rx) =
        rig.registry.accept(ConnectionKind::Agent, "wrapper".to_owned(), Some(agent_id)).await;
    rig.router.on_agent_connected(agent_id).await;

    let redispatched = recv_until(&mut new_agent_rx, |m| match m {
        Message::CommandRequest(r) => Some(r.command_id),
        _ => None,
    })
    .await?;
    assert_eq!(redispatched, held_id);
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_in_flight_and_queued() -> anyhow::Result<()> {
    let rig = rig().await?;
    let (agent_id, _agent_rx) = rig.ready_agent().await;
    let (_dash_id, mut dash_rx) = rig.subscriber(agent_id).await;

    let running = request(agent_id, "long", CommandPriority::Normal);
    let queued = request(agent_id, "waiting", CommandPriority::Normal);
    let running_id = running.command_id;
    let queued_id = queued.command_id;
    rig.router.submit(running, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    rig.router.submit(queued, None, "op").await.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    rig.router.drain_for_shutdown().await;

    let mut terminal = std::collections::HashMap::new();
    for _ in 0..2 {
        let status = recv_until(&mut dash_rx, |m| match m {
            Message::CommandStatus(s) if s.status.is_terminal() => Some(s.clone()),
            _ => None,
        })
        .await?;
        terminal.insert(status.command_id, status.status);
    }
    assert_eq!(terminal.get(&running_id), Some(&CommandState::Failed));
    assert_eq!(terminal.get(&queued_id), Some(&CommandState::Cancelled));
    Ok(())
}
