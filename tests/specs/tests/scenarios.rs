// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: dashboard and wrapper against a live server.

use std::time::Duration;

use onsembl_protocol::messages::{
    AgentControl, CommandInterrupt, CommandOptions, CommandRequest, ControlAction, Message,
};
use onsembl_protocol::{AgentKind, AgentStatus, CommandPriority, CommandState, StreamKind};
use onsembl_server::audit::{AuditKind, AuditQuery};
use serde_json::json;
use uuid::Uuid;

use onsembl_specs::{
    collect_for, dashboard, recv_until, script, send, send_raw, SpecAgent, SpecServer,
};

const SCRIPTED_AGENT: &str = r#"#!/bin/sh
case "$1" in
  "echo hi") echo "hi";;
  multiline) for i in 1 2 3 4 5; do echo "Line $i"; done;;
  error) echo "Error: something failed" >&2; exit 1;;
  ticker) i=0; while [ $i -lt 100 ]; do echo "tick $i"; i=$((i+1)); sleep 0.2; done;;
esac
"#;

const INTERACTIVE_AGENT: &str = r#"#!/bin/sh
echo "Ready for input"
while IFS= read -r line; do
  echo "output for: $line"
  echo "claude>"
done
"#;

fn request(agent_id: Uuid, command: &str) -> CommandRequest {
    CommandRequest {
        command_id: Uuid::new_v4(),
        agent_id,
        command: command.to_owned(),
        args: vec![],
        options: CommandOptions::default(),
        priority: CommandPriority::Normal,
    }
}

/// Wait until the dashboard has seen the agent become ready.
async fn wait_ready(ws: &mut onsembl_specs::Ws, agent_id: Uuid) -> anyhow::Result<()> {
    recv_until(ws, |m| match m {
        Message::AgentStatus(s) if s.agent_id == agent_id && s.status == AgentStatus::Ready => {
            Some(())
        }
        _ => None,
    })
    .await
}

// -- S1: echo -----------------------------------------------------------------

#[tokio::test]
async fn s1_echo_round_trip() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", SCRIPTED_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Custom).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let req = request(agent.agent_id, "echo hi");
    let command_id = req.command_id;
    send(&mut dash, Message::CommandRequest(req)).await?;

    let mut states = vec![];
    let mut outputs = vec![];
    loop {
        enum Seen {
            Status(CommandState, Option<i32>),
            Output(String, StreamKind, u64),
        }
        let seen = recv_until(&mut dash, |m| match m {
            Message::CommandStatus(s) if s.command_id == command_id => {
                Some(Seen::Status(s.status, s.exit_code))
            }
            Message::TerminalOutput(o) if o.command_id == command_id => {
                Some(Seen::Output(o.data.clone(), o.stream, o.sequence))
            }
            _ => None,
        })
        .await?;
        match seen {
            Seen::Status(state, exit_code) => {
                states.push((state, exit_code));
                if state.is_terminal() {
                    break;
                }
            }
            Seen::Output(data, stream, sequence) => outputs.push((data, stream, sequence)),
        }
    }

    assert_eq!(
        states,
        vec![
            (CommandState::Queued, None),
            (CommandState::Running, None),
            (CommandState::Completed, Some(0)),
        ]
    );
    assert_eq!(outputs, vec![("hi\n".to_owned(), StreamKind::Stdout, 1)]);
    Ok(())
}

// -- S2: multi-line ordering --------------------------------------------------

#[tokio::test]
async fn s2_multiline_ordering() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", SCRIPTED_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Custom).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let req = request(agent.agent_id, "multiline");
    let command_id = req.command_id;
    send(&mut dash, Message::CommandRequest(req)).await?;

    let mut lines = vec![];
    for _ in 0..5 {
        let (seq, data) = recv_until(&mut dash, |m| match m {
            Message::TerminalOutput(o) if o.command_id == command_id => {
                Some((o.sequence, o.data.clone()))
            }
            _ => None,
        })
        .await?;
        lines.push((seq, data));
    }
    // Contiguous from 1, arrival order respects sequence order.
    for (i, (seq, data)) in lines.iter().enumerate() {
        assert_eq!(*seq, (i + 1) as u64);
        assert_eq!(*data, format!("Line {}\n", i + 1));
    }

    let state = recv_until(&mut dash, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some(s.status)
        }
        _ => None,
    })
    .await?;
    assert_eq!(state, CommandState::Completed);
    Ok(())
}

// -- S3: stderr error ---------------------------------------------------------

#[tokio::test]
async fn s3_stderr_and_nonzero_exit() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", SCRIPTED_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Custom).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let req = request(agent.agent_id, "error");
    let command_id = req.command_id;
    send(&mut dash, Message::CommandRequest(req)).await?;

    let stderr = recv_until(&mut dash, |m| match m {
        Message::TerminalOutput(o)
            if o.command_id == command_id && o.stream == StreamKind::Stderr =>
        {
            Some(o.data.clone())
        }
        _ => None,
    })
    .await?;
    assert!(stderr.contains("Error"));

    let (state, exit_code) = recv_until(&mut dash, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some((s.status, s.exit_code))
        }
        _ => None,
    })
    .await?;
    // Non-zero exits resolve the command as failed, carrying the code.
    assert_eq!(state, CommandState::Failed);
    assert_eq!(exit_code, Some(1));
    Ok(())
}

// -- S4: interrupt ------------------------------------------------------------

#[tokio::test]
async fn s4_interrupt_stops_output() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", SCRIPTED_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Custom).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let req = request(agent.agent_id, "ticker");
    let command_id = req.command_id;
    send(&mut dash, Message::CommandRequest(req)).await?;

    // After the first chunk, interrupt.
    recv_until(&mut dash, |m| match m {
        Message::TerminalOutput(o) if o.command_id == command_id => Some(()),
        _ => None,
    })
    .await?;
    let sent_at = std::time::Instant::now();
    send(
        &mut dash,
        Message::CommandInterrupt(CommandInterrupt {
            command_id,
            reason: Some("operator".to_owned()),
        }),
    )
    .await?;

    let state = recv_until(&mut dash, |m| match m {
        Message::CommandStatus(s) if s.command_id == command_id && s.status.is_terminal() => {
            Some(s.status)
        }
        _ => None,
    })
    .await?;
    assert_eq!(state, CommandState::Interrupted);
    assert!(sent_at.elapsed() < Duration::from_secs(2), "ack must land within the grace window");

    // No further output for that command after the terminal status.
    let late: Vec<u64> = collect_for(&mut dash, Duration::from_millis(600), |m| match m {
        Message::TerminalOutput(o) if o.command_id == command_id => Some(o.sequence),
        _ => None,
    })
    .await?;
    assert!(late.is_empty(), "unexpected output after interrupt: {late:?}");
    Ok(())
}

// -- S5: restart with backoff -------------------------------------------------

#[tokio::test]
async fn s5_child_restart_is_not_an_emergency() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", INTERACTIVE_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Claude).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let pid = agent.wait_child_pid().await?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(pid)?),
        nix::sys::signal::Signal::SIGKILL,
    )?;

    recv_until(&mut dash, |m| match m {
        Message::AgentStatus(s) if s.agent_id == agent.agent_id && s.status == AgentStatus::Error => {
            Some(())
        }
        _ => None,
    })
    .await?;
    // Backoff, respawn, ready again.
    wait_ready(&mut dash, agent.agent_id).await?;

    // A restart is not an emergency stop.
    let entries = server
        .store
        .audit
        .query(&AuditQuery { kind: Some(AuditKind::EmergencyStop), ..Default::default() })
        .await;
    assert!(entries.is_empty());
    Ok(())
}

// -- S6: audit redaction ------------------------------------------------------

#[tokio::test]
async fn s6_audit_redaction() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;

    // Dashboard login whose payload carries a password field.
    let (mut dash, _) = tokio_tungstenite::connect_async(format!(
        "ws://{}/ws/dashboard",
        server.addr
    ))
    .await?;
    send_raw(
        &mut dash,
        json!({
            "version": "1.0.0",
            "type": "dashboard:connect",
            "id": Uuid::new_v4().to_string(),
            "timestamp": 1_700_000_000_000_i64,
            "payload": {"token": "T", "clientInfo": "s6", "password": "p"},
        }),
    )
    .await?;
    recv_until(&mut dash, |m| match m {
        Message::ConnectionAck(_) => Some(()),
        _ => None,
    })
    .await?;

    // Agent connect whose payload carries a token field.
    let agent_id = Uuid::new_v4();
    let (mut agent_ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://{}/ws/agent?agentId={agent_id}&token=t",
        server.addr
    ))
    .await?;
    send_raw(
        &mut agent_ws,
        json!({
            "version": "1.0.0",
            "type": "agent:connect",
            "id": Uuid::new_v4().to_string(),
            "timestamp": 1_700_000_000_000_i64,
            "payload": {
                "agentId": agent_id.to_string(),
                "agentType": "claude",
                "agentName": "s6-agent",
                "version": "0.3.0",
                "hostMachine": {"hostname": "s6-host"},
                "token": "t",
            },
        }),
    )
    .await?;
    recv_until(&mut agent_ws, |m| match m {
        Message::ConnectionAck(_) => Some(()),
        _ => None,
    })
    .await?;

    let logins = server
        .store
        .audit
        .query(&AuditQuery { kind: Some(AuditKind::UserLogin), ..Default::default() })
        .await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].details.get("password"), Some(&json!("[REDACTED]")));
    assert!(!logins[0].details.contains_key("token"));

    let connects = server
        .store
        .audit
        .query(&AuditQuery { kind: Some(AuditKind::AgentConnect), ..Default::default() })
        .await;
    assert_eq!(connects.len(), 1);
    assert!(!connects[0].details.contains_key("token"));
    Ok(())
}

// -- emergency stop -----------------------------------------------------------

#[tokio::test]
async fn emergency_stop_cancels_queue_and_audits_once() -> anyhow::Result<()> {
    let server = SpecServer::start().await?;
    let tmp = tempfile::tempdir()?;
    let cmd = script(tmp.path(), "agent.sh", SCRIPTED_AGENT)?;
    let agent = SpecAgent::start(&server, &cmd, AgentKind::Custom).await?;

    let mut dash = dashboard(&server, &[agent.agent_id]).await?;
    wait_ready(&mut dash, agent.agent_id).await?;

    let running = request(agent.agent_id, "ticker");
    let queued = request(agent.agent_id, "echo hi");
    let running_id = running.command_id;
    let queued_id = queued.command_id;
    send(&mut dash, Message::CommandRequest(running)).await?;
    // Wait until the first command is actually running before queueing more.
    recv_until(&mut dash, |m| match m {
        Message::CommandStatus(s)
            if s.command_id == running_id && s.status == CommandState::Running =>
        {
            Some(())
        }
        _ => None,
    })
    .await?;
    send(&mut dash, Message::CommandRequest(queued)).await?;
    recv_until(&mut dash, |m| match m {
        Message::CommandStatus(s) if s.command_id == queued_id && s.status == CommandState::Queued => {
            Some(())
        }
        _ => None,
    })
    .await?;

    // Nil agent id = stop everything.
    send(
        &mut dash,
        Message::AgentControl(AgentControl { agent_id: Uuid::nil(), action: ControlAction::Stop }),
    )
    .await?;

    let mut terminal = std::collections::HashMap::new();
    while terminal.len() < 2 {
        let (id, state) = recv_until(&mut dash, |m| match m {
            Message::CommandStatus(s) if s.status.is_terminal() => Some((s.command_id, s.status)),
            _ => None,
        })
        .await?;
        terminal.insert(id, state);
    }
    assert_eq!(terminal.get(&queued_id), Some(&CommandState::Cancelled));
    assert!(matches!(
        terminal.get(&running_id),
        Some(&CommandState::Interrupted) | Some(&CommandState::Failed)
    ));

    let entries = server
        .store
        .audit
        .query(&AuditQuery { kind: Some(AuditKind::EmergencyStop), ..Default::default() })
        .await;
    assert_eq!(entries.len(), 1);
    Ok(())
}
