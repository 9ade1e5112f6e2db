// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command router: per-agent priority queues, dispatch, interruption,
//! emergency stop, and output fan-out.
//!
//! All per-agent state lives in a lane guarded by one async mutex, so
//! command:status for a command is always enqueued after every prior
//! terminal:output for it and dispatch order per agent is total.

pub mod queue;

pub use queue::{AgentQueue, QueuedCommand};

use std::collections::HashMap;
use std::future::Future;
use std::io::Write as _;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use onsembl_protocol::messages::{
    AgentControl, CommandComplete, CommandInterrupt, CommandQueueUpdate, CommandRequest,
    CommandStatusUpdate, ControlAction, Message, TerminalOutput,
};
use onsembl_protocol::{AgentStatus, CommandState, Frame, StreamKind};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::directory::AgentDirectory;
use crate::registry::ConnectionRegistry;

/// Router timers, taken from the server config.
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub command_timeout: std::time::Duration,
    pub interrupt_grace: std::time::Duration,
}

/// Why [`CommandRouter::submit`] refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    UnknownAgent,
    AgentStopping,
}

impl SubmitError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnknownAgent => "target agent does not exist",
            Self::AgentStopping => "target agent is stopping",
        }
    }
}

/// The command currently dispatched to an agent (at most one).
struct ActiveCommand {
    cmd: QueuedCommand,
    state: CommandState,
    last_sequence: u64,
    dispatched_at: Instant,
    /// Cancels the timeout and interrupt-grace watchers.
    guard: CancellationToken,
    interrupting: bool,
}

#[derive(Default)]
struct AgentLane {
    queue: AgentQueue,
    active: Option<ActiveCommand>,
}

/// Result of an emergency stop, for the audit entry and the caller.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStopReport {
    pub agents: Vec<Uuid>,
    pub interrupted: Vec<Uuid>,
    pub cancelled: Vec<Uuid>,
}

pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<AgentDirectory>,
    audit: AuditLog,
    settings: RouterSettings,
    lanes: RwLock<HashMap<Uuid, Arc<Mutex<AgentLane>>>>,
    /// command id → target agent id, for interrupt routing.
    index: RwLock<HashMap<Uuid, Uuid>>,
    /// Queues drained after a slow-consumer close, keyed by agent id.
    holding: Mutex<HashMap<Uuid, Vec<QueuedCommand>>>,
    /// Where to retain output chunks for commands that ask for it.
    output_dir: Option<PathBuf>,
}

fn encode(message: Message) -> Option<Vec<u8>> {
    match Frame::authored(message).encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(err = %e, "authored frame failed to encode");
            None
        }
    }
}

impl CommandRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<AgentDirectory>,
        audit: AuditLog,
        settings: RouterSettings,
        output_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            directory,
            audit,
            settings,
            lanes: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            holding: Mutex::new(HashMap::new()),
            output_dir,
        })
    }

    async fn lane(&self, agent_id: Uuid) -> Arc<Mutex<AgentLane>> {
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(agent_id).or_default())
    }

    /// Validate and enqueue a command, dispatching immediately when the
    /// agent is ready and this command is the new head.
    pub async fn submit(
        self: &Arc<Self>,
        request: CommandRequest,
        requester_conn: Option<Uuid>,
        principal: &str,
    ) -> Result<(), SubmitError> {
        let agent_id = request.agent_id;
        let status = self.directory.status(agent_id).await.ok_or(SubmitError::UnknownAgent)?;
        if status == AgentStatus::Stopping {
            return Err(SubmitError::AgentStopping);
        }

        let command_id = request.command_id;
        let cmd = QueuedCommand::new(request, requester_conn, principal.to_owned());

        self.audit.record(
            AuditEntry::new(AuditKind::CommandSent)
                .with_user(principal)
                .with_agent(agent_id)
                .with_command(command_id)
                .with_detail("command", cmd.request.command.clone())
                .with_detail("priority", cmd.request.priority.as_str()),
        );
        self.index.write().await.insert(command_id, agent_id);

        {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            lane.queue.push(cmd);
        }

        self.emit_status(agent_id, command_id, requester_conn, CommandState::Queued, None, None, None)
            .await;
        self.broadcast_queue(agent_id).await;
        self.maybe_dispatch(agent_id).await;
        Ok(())
    }

    /// Dispatch the queue head if the agent is ready and idle.
    ///
    /// Boxed explicitly (rather than `async fn`) because this function and
    /// `force_fail` call each other, and an opaque `impl Future` here would
    /// make that mutual recursion self-referential for auto-trait checking.
    pub fn maybe_dispatch(
        self: &Arc<Self>,
        agent_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.maybe_dispatch_inner(agent_id))
    }

    async fn maybe_dispatch_inner(self: &Arc<Self>, agent_id: Uuid) {
        if self.directory.status(agent_id).await != Some(AgentStatus::Ready) {
            return;
        }
        let popped = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            if lane.active.is_some() {
                return;
            }
            let Some(cmd) = lane.queue.pop_head() else {
                return;
            };
            let guard = CancellationToken::new();
            let timeout = cmd
                .request
                .options
                .timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(self.settings.command_timeout);
            lane.active = Some(ActiveCommand {
                cmd: cmd.clone(),
                state: CommandState::Dispatched,
                last_sequence: 0,
                dispatched_at: Instant::now(),
                guard: guard.clone(),
                interrupting: false,
            });
            (cmd, guard, timeout)
        };
        let (cmd, guard, timeout) = popped;
        let command_id = cmd.command_id();

        self.directory.set_status(agent_id, AgentStatus::Busy).await;
        self.broadcast_agent_status(agent_id).await;

        if let Some(bytes) = encode(Message::CommandRequest(cmd.request.clone())) {
            if let Some(conn) = self.registry.agent_connection(agent_id).await {
                let _ = self.registry.send_to(&conn, bytes).await;
            }
        }
        self.broadcast_queue(agent_id).await;

        // Timeout watcher; cancelled by the guard on any terminal path.
        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    router.force_fail(agent_id, command_id, "timeout").await;
                }
            }
        });
    }

    /// Fan one wrapper output chunk out to subscribed dashboards.
    ///
    /// Duplicates (sequence ≤ last seen) are dropped. Gaps are logged but
    /// the chunk is still forwarded; dashboards resequence on their side.
    pub async fn on_output(self: &Arc<Self>, agent_id: Uuid, frame: &Frame, chunk: &TerminalOutput) {
        let (became_running, persist) = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            let Some(ref mut active) = lane.active else {
                tracing::debug!(command = %chunk.command_id, "output with no dispatched command, dropped");
                return;
            };
            if active.cmd.command_id() != chunk.command_id {
                tracing::warn!(
                    expected = %active.cmd.command_id(),
                    got = %chunk.command_id,
                    "output for a command that is not dispatched, dropped"
                );
                return;
            }
            if chunk.sequence <= active.last_sequence {
                tracing::debug!(seq = chunk.sequence, "duplicate output chunk dropped");
                return;
            }
            if chunk.sequence > active.last_sequence + 1 {
                tracing::error!(
                    command = %chunk.command_id,
                    expected = active.last_sequence + 1,
                    got = chunk.sequence,
                    "out-of-order output chunk"
                );
            }
            active.last_sequence = chunk.sequence;
            let persist = active.cmd.request.options.persist_output;
            if active.state == CommandState::Dispatched {
                active.state = CommandState::Running;
                (true, persist)
            } else {
                (false, persist)
            }
        };

        if became_running {
            self.emit_status(
                agent_id,
                chunk.command_id,
                None,
                CommandState::Running,
                None,
                None,
                None,
            )
            .await;
        }

        // Verbatim fan-out: unknown optional fields the wrapper attached
        // survive the hop.
        match frame.encode_forwarded() {
            Ok(bytes) => self.registry.broadcast_to_subscribers(agent_id, &bytes, None).await,
            Err(e) => tracing::error!(err = %e, "output chunk failed to re-encode"),
        }

        if persist {
            self.retain_output(chunk);
        }
    }

    /// Resolve the dispatched command from the wrapper's completion report.
    pub async fn on_complete(self: &Arc<Self>, agent_id: Uuid, completion: &CommandComplete) {
        let resolved = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            let matches = lane
                .active
                .as_ref()
                .is_some_and(|a| a.cmd.command_id() == completion.command_id);
            if !matches {
                tracing::debug!(command = %completion.command_id, "completion for unknown command ignored");
                return;
            }
            let Some(active) = lane.active.take() else {
                return;
            };
            active.guard.cancel();
            active
        };

        let state = if completion.interrupted {
            CommandState::Interrupted
        } else if completion.exit_code == Some(0) {
            CommandState::Completed
        } else {
            CommandState::Failed
        };
        let execution_ms = resolved.dispatched_at.elapsed().as_millis() as u64;

        self.finish(
            agent_id,
            &resolved.cmd,
            state,
            completion.exit_code,
            completion.error.clone(),
            Some(execution_ms),
        )
        .await;

        self.directory.set_status(agent_id, AgentStatus::Ready).await;
        self.broadcast_agent_status(agent_id).await;
        self.maybe_dispatch(agent_id).await;
    }

    /// Interrupt a dispatched command or cancel a queued one.
    ///
    /// Returns false when the command is unknown.
    pub async fn interrupt(self: &Arc<Self>, command_id: Uuid, reason: Option<String>) -> bool {
        let Some(agent_id) = self.index.read().await.get(&command_id).copied() else {
            return false;
        };

        enum Action {
            Dispatched(CancellationToken),
            Cancelled(QueuedCommand),
            Unknown,
        }

        let action = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            if let Some(ref mut active) = lane.active {
                if active.cmd.command_id() == command_id {
                    active.interrupting = true;
                    Action::Dispatched(active.guard.clone())
                } else if let Some(cmd) = lane.queue.remove(command_id) {
                    Action::Cancelled(cmd)
                } else {
                    Action::Unknown
                }
            } else if let Some(cmd) = lane.queue.remove(command_id) {
                Action::Cancelled(cmd)
            } else {
                Action::Unknown
            }
        };

        match action {
            Action::Dispatched(guard) => {
                if let Some(bytes) = encode(Message::CommandInterrupt(CommandInterrupt {
                    command_id,
                    reason,
                })) {
                    if let Some(conn) = self.registry.agent_connection(agent_id).await {
                        let _ = self.registry.send_to(&conn, bytes).await;
                    }
                }
                // Grace watcher: the wrapper must acknowledge within the
                // window or the command is force-failed.
                let router = Arc::clone(self);
                let grace = self.settings.interrupt_grace;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = guard.cancelled() => {}
                        _ = tokio::time::sleep(grace) => {
                            router.force_fail(agent_id, command_id, "interrupt-timeout").await;
                        }
                    }
                });
                true
            }
            Action::Cancelled(cmd) => {
                self.finish(agent_id, &cmd, CommandState::Cancelled, None, reason, None).await;
                self.broadcast_queue(agent_id).await;
                true
            }
            Action::Unknown => false,
        }
    }

    /// Interrupt running heads, drain queues into cancelled, and direct the
    /// wrappers to stop. One audit entry covers the whole action.
    pub async fn emergency_stop(
        self: &Arc<Self>,
        scope: Option<Vec<Uuid>>,
        requested_by: &str,
    ) -> EmergencyStopReport {
        let agents = match scope {
            Some(ids) => ids,
            None => self.directory.ids().await,
        };
        let mut report = EmergencyStopReport { agents: agents.clone(), ..Default::default() };

        for agent_id in &agents {
            let agent_id = *agent_id;
            let (active_id, drained) = {
                let lane = self.lane(agent_id).await;
                let mut lane = lane.lock().await;
                let active_id = lane.active.as_ref().map(|a| a.cmd.command_id());
                if let Some(ref mut active) = lane.active {
                    active.interrupting = true;
                }
                (active_id, lane.queue.drain())
            };

            if let Some(command_id) = active_id {
                report.interrupted.push(command_id);
                self.interrupt(command_id, Some("emergency stop".to_owned())).await;
            }
            for cmd in drained {
                report.cancelled.push(cmd.command_id());
                self.finish(
                    agent_id,
                    &cmd,
                    CommandState::Cancelled,
                    None,
                    Some("emergency stop".to_owned()),
                    None,
                )
                .await;
            }

            if let Some(bytes) = encode(Message::AgentControl(AgentControl {
                agent_id,
                action: ControlAction::Stop,
            })) {
                if let Some(conn) = self.registry.agent_connection(agent_id).await {
                    let _ = self.registry.send_to(&conn, bytes).await;
                }
            }
            self.broadcast_queue(agent_id).await;
        }

        self.audit.record(
            AuditEntry::new(AuditKind::EmergencyStop)
                .with_user(requested_by)
                .with_detail(
                    "agents",
                    serde_json::json!(report.agents.iter().map(ToString::to_string).collect::<Vec<_>>()),
                )
                .with_detail(
                    "interruptedCommands",
                    serde_json::json!(report
                        .interrupted
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()),
                )
                .with_detail(
                    "cancelledCommands",
                    serde_json::json!(report
                        .cancelled
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()),
                ),
        );
        report
    }

    /// The agent's socket went away. The dispatched command fails with a
    /// transport reason; on slow-consumer closes the remaining queue moves
    /// to the holding list for re-enqueue on the next connect.
    pub async fn on_agent_disconnected(self: &Arc<Self>, agent_id: Uuid, slow_consumer: bool) {
        let (active, drained) = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            let active = lane.active.take();
            let drained = if slow_consumer { lane.queue.drain() } else { vec![] };
            (active, drained)
        };

        if let Some(active) = active {
            active.guard.cancel();
            self.synthetic_output(agent_id, &active, "command failed: transport dropped").await;
            self.finish(
                agent_id,
                &active.cmd,
                CommandState::Failed,
                None,
                Some("transport".to_owned()),
                None,
            )
            .await;
        }
        if !drained.is_empty() {
            tracing::info!(agent_id = %agent_id, held = drained.len(), "holding queue after slow-consumer close");
            self.holding.lock().await.entry(agent_id).or_default().extend(drained);
            self.broadcast_queue(agent_id).await;
        }
    }

    /// Re-enqueue any held commands ahead of new work (priority preserved).
    pub async fn on_agent_connected(self: &Arc<Self>, agent_id: Uuid) {
        let held = self.holding.lock().await.remove(&agent_id).unwrap_or_default();
        if held.is_empty() {
            return;
        }
        {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            lane.queue.requeue_front(held);
        }
        self.broadcast_queue(agent_id).await;
        self.maybe_dispatch(agent_id).await;
    }

    /// Shutdown: every in-flight command fails with `shutdown`, every
    /// queued command is cancelled.
    pub async fn drain_for_shutdown(self: &Arc<Self>) {
        let agent_ids: Vec<Uuid> = self.lanes.read().await.keys().copied().collect();
        for agent_id in agent_ids {
            let (active, drained) = {
                let lane = self.lane(agent_id).await;
                let mut lane = lane.lock().await;
                (lane.active.take(), lane.queue.drain())
            };
            if let Some(active) = active {
                active.guard.cancel();
                self.finish(
                    agent_id,
                    &active.cmd,
                    CommandState::Failed,
                    None,
                    Some("shutdown".to_owned()),
                    None,
                )
                .await;
            }
            for cmd in drained {
                self.finish(
                    agent_id,
                    &cmd,
                    CommandState::Cancelled,
                    None,
                    Some("shutdown".to_owned()),
                    None,
                )
                .await;
            }
        }
    }

    /// Wire snapshot of an agent's queue.
    pub async fn queue_snapshot(&self, agent_id: Uuid) -> CommandQueueUpdate {
        let lane = self.lane(agent_id).await;
        let lane = lane.lock().await;
        CommandQueueUpdate { agent_id, queue: lane.queue.entries() }
    }

    /// Force a dispatched command into `failed{reason}` (timeout paths).
    async fn force_fail(self: &Arc<Self>, agent_id: Uuid, command_id: Uuid, reason: &str) {
        let active = {
            let lane = self.lane(agent_id).await;
            let mut lane = lane.lock().await;
            let matches =
                lane.active.as_ref().is_some_and(|a| a.cmd.command_id() == command_id);
            if !matches {
                return;
            }
            let Some(active) = lane.active.take() else {
                return;
            };
            active.guard.cancel();
            active
        };

        self.synthetic_output(agent_id, &active, &format!("command failed: {reason}")).await;
        self.finish(
            agent_id,
            &active.cmd,
            CommandState::Failed,
            None,
            Some(reason.to_owned()),
            Some(active.dispatched_at.elapsed().as_millis() as u64),
        )
        .await;

        self.directory.set_status(agent_id, AgentStatus::Ready).await;
        self.broadcast_agent_status(agent_id).await;
        self.maybe_dispatch(agent_id).await;
    }

    /// Emit the terminal status, audit the completion, and drop the index
    /// entry. Used for every terminal path so invariant "exactly one
    /// terminal state" holds in one place.
    async fn finish(
        &self,
        agent_id: Uuid,
        cmd: &QueuedCommand,
        state: CommandState,
        exit_code: Option<i32>,
        error: Option<String>,
        execution_ms: Option<u64>,
    ) {
        self.index.write().await.remove(&cmd.command_id());
        self.emit_status(
            agent_id,
            cmd.command_id(),
            cmd.requester_conn,
            state,
            exit_code,
            error.clone(),
            execution_ms,
        )
        .await;

        let mut entry = AuditEntry::new(AuditKind::CommandCompleted)
            .with_user(cmd.principal.clone())
            .with_agent(agent_id)
            .with_command(cmd.command_id())
            .with_detail("status", state.as_str());
        if let Some(code) = exit_code {
            entry = entry.with_detail("exitCode", code);
        }
        if let Some(ref reason) = error {
            entry = entry.with_detail("reason", reason.clone());
        }
        if let Some(ms) = execution_ms {
            entry = entry.with_detail("executionTimeMs", ms);
        }
        self.audit.record(entry);
    }

    /// One last synthetic chunk telling dashboards why a command died.
    async fn synthetic_output(&self, agent_id: Uuid, active: &ActiveCommand, text: &str) {
        let chunk = TerminalOutput {
            command_id: active.cmd.command_id(),
            agent_id,
            data: format!("{text}\n"),
            stream: StreamKind::Stderr,
            sequence: active.last_sequence + 1,
            ansi_codes: None,
            is_blank: false,
            is_binary: false,
        };
        if let Some(bytes) = encode(Message::TerminalOutput(chunk)) {
            self.registry.broadcast_to_subscribers(agent_id, &bytes, None).await;
        }
    }

    async fn emit_status(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        requester_conn: Option<Uuid>,
        status: CommandState,
        exit_code: Option<i32>,
        error: Option<String>,
        execution_time_ms: Option<u64>,
    ) {
        let Some(bytes) = encode(Message::CommandStatus(CommandStatusUpdate {
            command_id,
            agent_id,
            status,
            exit_code,
            error,
            execution_time_ms,
        })) else {
            return;
        };
        self.registry.broadcast_to_subscribers(agent_id, &bytes, requester_conn).await;
        if let Some(conn_id) = requester_conn {
            let _ = self.registry.send(conn_id, bytes).await;
        }
    }

    async fn broadcast_queue(&self, agent_id: Uuid) {
        let snapshot = self.queue_snapshot(agent_id).await;
        if let Some(bytes) = encode(Message::CommandQueue(snapshot)) {
            self.registry.broadcast_to_subscribers(agent_id, &bytes, None).await;
        }
    }

    /// Broadcast the directory's view of an agent to its subscribers.
    pub async fn broadcast_agent_status(&self, agent_id: Uuid) {
        let Some(record) = self.directory.get(agent_id).await else {
            return;
        };
        let update = onsembl_protocol::messages::AgentStatusUpdate {
            agent_id,
            agent_type: record.kind,
            status: record.status,
            capabilities: Some(record.capabilities.clone()),
            metadata: None,
        };
        if let Some(bytes) = encode(Message::AgentStatus(update)) {
            self.registry.broadcast_to_subscribers(agent_id, &bytes, None).await;
        }
    }

    /// Retain a chunk on disk when the command asked for it.
    fn retain_output(&self, chunk: &TerminalOutput) {
        let Some(ref dir) = self.output_dir else {
            return;
        };
        let path = dir.join(format!("{}.jsonl", chunk.command_id));
        let Ok(mut line) = serde_json::to_string(chunk) else {
            return;
        };
        line.push('\n');
        let _ = std::fs::create_dir_all(dir);
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = file.write_all(line.as_bytes());
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod router_tests;
