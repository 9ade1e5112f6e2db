// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent supervisor: child lifecycle, readiness detection, health checks,
//! and command execution.
//!
//! Interactive kinds (claude, gemini, codex) hold one long-running child;
//! command text goes to its stdin and completion is detected when the
//! kind's prompt sentinel reappears. The custom kind spawns one child per
//! command and completes on exit.

pub mod child;
pub mod stream;

pub use child::{pid_running, ChildProcess, StopSignal};
pub use stream::{LineScanner, ScannedChunk};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use onsembl_protocol::messages::{CommandRequest, ControlAction};
use onsembl_protocol::{AgentKind, AgentStatus, StreamKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::reconnect::Backoff;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_HEALTH_FAILURES: u32 = 3;
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Wrapper-side lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    Connecting,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Error,
}

impl WrapperState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// The status reported over the wire. `stopped` has no wire peer of its
    /// own; the agent is simply offline.
    pub fn wire_status(&self) -> AgentStatus {
        match self {
            Self::Connecting => AgentStatus::Connecting,
            Self::Ready => AgentStatus::Ready,
            Self::Busy => AgentStatus::Busy,
            Self::Stopping => AgentStatus::Stopping,
            Self::Stopped => AgentStatus::Offline,
            Self::Error => AgentStatus::Error,
        }
    }
}

/// Per-kind behavior profile.
#[derive(Debug, Clone)]
pub struct KindProfile {
    /// Stdout markers that move `connecting → ready`.
    pub ready_sentinels: Vec<String>,
    /// Prompt marker whose reappearance completes an interactive command.
    pub prompt_sentinel: Option<String>,
    pub stop_signal: StopSignal,
    pub interactive: bool,
}

/// Default profile for a kind, with config overrides applied.
pub fn profile_for(kind: AgentKind, config: &Config) -> KindProfile {
    let mut profile = match kind {
        AgentKind::Claude => KindProfile {
            ready_sentinels: vec!["Ready for input".to_owned(), "claude>".to_owned()],
            prompt_sentinel: Some("claude>".to_owned()),
            stop_signal: StopSignal::Etx,
            interactive: true,
        },
        AgentKind::Gemini => KindProfile {
            ready_sentinels: vec!["Ready for input".to_owned(), "gemini>".to_owned()],
            prompt_sentinel: Some("gemini>".to_owned()),
            stop_signal: StopSignal::Etx,
            interactive: true,
        },
        AgentKind::Codex => KindProfile {
            ready_sentinels: vec!["Ready for input".to_owned(), "codex>".to_owned()],
            prompt_sentinel: Some("codex>".to_owned()),
            stop_signal: StopSignal::Etx,
            interactive: true,
        },
        AgentKind::Custom => KindProfile {
            ready_sentinels: vec![],
            prompt_sentinel: None,
            stop_signal: StopSignal::Term,
            interactive: false,
        },
    };
    if let Some(interactive) = config.interactive {
        profile.interactive = interactive;
    }
    if let Some(ref name) = config.stop_signal {
        if let Some(signal) = StopSignal::from_name(name) {
            profile.stop_signal = signal;
        }
    }
    profile
}

/// Control-plane directives handed to the supervisor.
#[derive(Debug)]
pub enum Directive {
    Execute(CommandRequest),
    Interrupt { command_id: Uuid, reason: Option<String> },
    Control(ControlAction),
}

/// Events the supervisor emits toward the control-plane session.
#[derive(Debug)]
pub enum WrapperEvent {
    Status {
        state: WrapperState,
        cause: String,
    },
    Output {
        command_id: Uuid,
        stream: StreamKind,
        sequence: u64,
        chunk: ScannedChunk,
    },
    Completed {
        command_id: Uuid,
        exit_code: Option<i32>,
        interrupted: bool,
        error: Option<String>,
    },
    /// Reported as `agent:error` and audited server-side.
    Fault {
        code: String,
        message: String,
    },
}

/// Why the supervisor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Graceful stop (control directive or shutdown).
    Stopped,
    /// The child could not be kept alive; operator action required.
    ChildFatal,
}

/// The command currently executing.
struct ActiveExec {
    command_id: Uuid,
    sequence: u64,
    interrupted: bool,
}

type StreamRx = mpsc::Receiver<(StreamKind, Bytes)>;

pub struct Supervisor {
    config: Config,
    profile: KindProfile,
    state: WrapperState,
    events: mpsc::Sender<WrapperEvent>,
    shutdown: CancellationToken,
    /// Mirror of the child's PID for the heartbeat sampler.
    child_pid: Arc<AtomicU32>,

    child: Option<ChildProcess>,
    active: Option<ActiveExec>,
    stdout_scanner: LineScanner,
    stderr_scanner: LineScanner,
    restart_backoff: Backoff,
    health_failures: u32,
    ready_deadline: Option<Instant>,
}

async fn recv_stream(rx: &mut Option<StreamRx>) -> Option<(StreamKind, Bytes)> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Supervisor {
    pub fn new(
        config: Config,
        kind: AgentKind,
        events: mpsc::Sender<WrapperEvent>,
        shutdown: CancellationToken,
        child_pid: Arc<AtomicU32>,
    ) -> Self {
        let profile = profile_for(kind, &config);
        let buffer = config.output_buffer_size;
        Self {
            config,
            profile,
            state: WrapperState::Connecting,
            events,
            shutdown,
            child_pid,
            child: None,
            active: None,
            stdout_scanner: LineScanner::new(buffer),
            stderr_scanner: LineScanner::new(buffer),
            restart_backoff: Backoff::new(Duration::from_secs(1), MAX_RESTART_ATTEMPTS),
            health_failures: 0,
            ready_deadline: None,
        }
    }

    /// Run until stopped. Consumes the directive channel.
    pub async fn run(mut self, mut directives: mpsc::Receiver<Directive>) -> SupervisorExit {
        let mut stream_rx: Option<StreamRx> = None;

        if self.profile.interactive {
            match self.spawn_interactive().await {
                Ok(rx) => stream_rx = Some(rx),
                Err(exit) => return exit,
            }
        } else {
            // Per-command mode has no persistent child to wait for.
            self.set_state(WrapperState::Ready, "per-command mode").await;
        }

        let mut flush_timer = tokio::time::interval(self.config.output_flush_interval());
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health_timer = tokio::time::interval(HEALTH_INTERVAL);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.graceful_stop("shutdown").await;
                    return SupervisorExit::Stopped;
                }
                received = recv_stream(&mut stream_rx) => {
                    match received {
                        Some((stream, bytes)) => self.on_stream(stream, &bytes).await,
                        None => {
                            stream_rx = None;
                            match self.on_child_exit().await {
                                Ok(rx) => stream_rx = rx,
                                Err(exit) => return exit,
                            }
                        }
                    }
                }
                directive = directives.recv() => {
                    let Some(directive) = directive else {
                        self.graceful_stop("session closed").await;
                        return SupervisorExit::Stopped;
                    };
                    match directive {
                        Directive::Execute(request) => {
                            if let Some(rx) = self.on_execute(request).await {
                                stream_rx = Some(rx);
                            }
                        }
                        Directive::Interrupt { command_id, reason } => {
                            let resolved = self.on_interrupt(command_id, reason).await;
                            if resolved && !self.profile.interactive {
                                stream_rx = None;
                            }
                        }
                        Directive::Control(ControlAction::Stop) => {
                            self.graceful_stop("control:stop").await;
                            return SupervisorExit::Stopped;
                        }
                        Directive::Control(ControlAction::Restart) => {
                            match self.restart("control:restart").await {
                                Ok(rx) => stream_rx = rx,
                                Err(exit) => return exit,
                            }
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    self.on_flush().await;
                    if let Err(exit) = self.check_ready_deadline().await {
                        return exit;
                    }
                }
                _ = health_timer.tick() => {
                    if let Err(exit) = self.on_health_check().await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn set_state(&mut self, next: WrapperState, cause: &str) {
        if self.state == next {
            return;
        }
        tracing::info!(from = self.state.as_str(), to = next.as_str(), cause, "state");
        self.state = next;
        let _ = self
            .events
            .send(WrapperEvent::Status { state: next, cause: cause.to_owned() })
            .await;
    }

    // -- child lifecycle ----------------------------------------------------

    async fn spawn_interactive(&mut self) -> Result<StreamRx, SupervisorExit> {
        self.set_state(WrapperState::Connecting, "spawning child").await;
        let program = self.config.agent_command.clone().unwrap_or_default();
        let env = self.config.child_env();
        match ChildProcess::spawn(
            &program,
            &[],
            self.config.working_directory.as_deref(),
            &env,
        ) {
            Ok((child, rx)) => {
                self.child_pid.store(child.pid.unwrap_or(0), Ordering::Release);
                self.child = Some(child);
                self.ready_deadline = Some(Instant::now() + READY_TIMEOUT);
                Ok(rx)
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(WrapperEvent::Fault {
                        code: "SPAWN_FAILED".to_owned(),
                        message: e.to_string(),
                    })
                    .await;
                self.set_state(WrapperState::Error, "spawn failed").await;
                Err(SupervisorExit::ChildFatal)
            }
        }
    }

    async fn graceful_stop(&mut self, cause: &str) {
        self.set_state(WrapperState::Stopping, cause).await;
        if let Some(active) = self.active.take() {
            let _ = self
                .events
                .send(WrapperEvent::Completed {
                    command_id: active.command_id,
                    exit_code: None,
                    interrupted: true,
                    error: None,
                })
                .await;
        }
        if let Some(mut child) = self.child.take() {
            child.graceful_stop(self.profile.stop_signal, GRACEFUL_STOP_TIMEOUT).await;
        }
        self.child_pid.store(0, Ordering::Release);
        self.set_state(WrapperState::Stopped, cause).await;
    }

    /// Child streams closed: resolve the active command, then restart the
    /// interactive child (or simply go idle in per-command mode).
    async fn on_child_exit(&mut self) -> Result<Option<StreamRx>, SupervisorExit> {
        // Flush whatever is still buffered before resolving.
        self.on_flush().await;

        let exit_code = match self.child.as_mut() {
            Some(child) => child.graceful_stop(StopSignal::Kill, Duration::from_secs(1)).await,
            None => None,
        };
        self.child = None;
        self.child_pid.store(0, Ordering::Release);

        if let Some(active) = self.active.take() {
            let interrupted = active.interrupted;
            let _ = self
                .events
                .send(WrapperEvent::Completed {
                    command_id: active.command_id,
                    exit_code: if interrupted { None } else { exit_code.or(Some(-1)) },
                    interrupted,
                    error: None,
                })
                .await;
        }

        if !self.profile.interactive {
            self.set_state(WrapperState::Ready, "command child exited").await;
            return Ok(None);
        }

        if self.state == WrapperState::Stopping || self.state == WrapperState::Stopped {
            return Ok(None);
        }

        // Unexpected exit of the long-running child.
        let _ = self
            .events
            .send(WrapperEvent::Fault {
                code: "CHILD_EXITED".to_owned(),
                message: format!("child exited unexpectedly (code {exit_code:?})"),
            })
            .await;
        self.schedule_restart("process:exit").await
    }

    /// Error → backoff → respawn. Gives up after the attempt budget.
    async fn schedule_restart(&mut self, cause: &str) -> Result<Option<StreamRx>, SupervisorExit> {
        self.set_state(WrapperState::Error, cause).await;
        let Some(delay) = self.restart_backoff.next_delay() else {
            tracing::error!("restart attempts exhausted");
            return Err(SupervisorExit::ChildFatal);
        };
        tracing::info!(delay_ms = delay.as_millis() as u64, "restart scheduled");
        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
        let rx = self.spawn_interactive().await?;
        Ok(Some(rx))
    }

    async fn restart(&mut self, cause: &str) -> Result<Option<StreamRx>, SupervisorExit> {
        if let Some(mut child) = self.child.take() {
            child.graceful_stop(self.profile.stop_signal, GRACEFUL_STOP_TIMEOUT).await;
        }
        self.child_pid.store(0, Ordering::Release);
        if let Some(active) = self.active.take() {
            let _ = self
                .events
                .send(WrapperEvent::Completed {
                    command_id: active.command_id,
                    exit_code: None,
                    interrupted: true,
                    error: None,
                })
                .await;
        }
        if !self.profile.interactive {
            self.set_state(WrapperState::Ready, cause).await;
            return Ok(None);
        }
        let rx = self.spawn_interactive().await?;
        Ok(Some(rx))
    }

    // -- command execution --------------------------------------------------

    async fn on_execute(&mut self, request: CommandRequest) -> Option<StreamRx> {
        if self.active.is_some() {
            tracing::warn!(command = %request.command_id, "execute while busy, ignored");
            return None;
        }
        let command_id = request.command_id;

        if self.profile.interactive {
            let Some(child) = self.child.as_mut() else {
                let _ = self
                    .events
                    .send(WrapperEvent::Completed {
                        command_id,
                        exit_code: None,
                        interrupted: false,
                        error: Some("no child process".to_owned()),
                    })
                    .await;
                return None;
            };
            let mut line = request.command.clone();
            if !request.args.is_empty() {
                line.push(' ');
                line.push_str(&request.args.join(" "));
            }
            line.push('\n');
            if let Err(e) = child.write_stdin(line.as_bytes()).await {
                let _ = self
                    .events
                    .send(WrapperEvent::Completed {
                        command_id,
                        exit_code: None,
                        interrupted: false,
                        error: Some(format!("stdin write failed: {e}")),
                    })
                    .await;
                return None;
            }
            self.active = Some(ActiveExec { command_id, sequence: 0, interrupted: false });
            self.set_state(WrapperState::Busy, "command dispatched").await;
            None
        } else {
            // Per-command mode: one child per command, completion on exit.
            let program = self.config.agent_command.clone().unwrap_or_default();
            let mut args = request.args.clone();
            args.push(request.command.clone());
            let mut env = self.config.child_env();
            env.extend(request.options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            let workdir: Option<PathBuf> = request
                .options
                .working_directory
                .as_ref()
                .map(PathBuf::from)
                .or_else(|| self.config.working_directory.clone());

            match ChildProcess::spawn(&program, &args, workdir.as_deref(), &env) {
                Ok((spawned, rx)) => {
                    self.child_pid.store(spawned.pid.unwrap_or(0), Ordering::Release);
                    self.child = Some(spawned);
                    self.active =
                        Some(ActiveExec { command_id, sequence: 0, interrupted: false });
                    self.set_state(WrapperState::Busy, "command dispatched").await;
                    Some(rx)
                }
                Err(e) => {
                    let _ = self
                        .events
                        .send(WrapperEvent::Completed {
                            command_id,
                            exit_code: None,
                            interrupted: false,
                            error: Some(format!("spawn failed: {e}")),
                        })
                        .await;
                    None
                }
            }
        }
    }

    /// Returns true when the interrupt resolved the active command.
    async fn on_interrupt(&mut self, command_id: Uuid, reason: Option<String>) -> bool {
        let matches = self.active.as_ref().is_some_and(|a| a.command_id == command_id);
        if !matches {
            tracing::debug!(command = %command_id, "interrupt for unknown command ignored");
            return false;
        }
        tracing::info!(command = %command_id, reason = reason.as_deref().unwrap_or(""), "interrupt");

        if self.profile.interactive {
            if let Some(child) = self.child.as_mut() {
                let _ = child.write_stdin(&[0x03]).await;
            }
            self.active = None;
            let _ = self
                .events
                .send(WrapperEvent::Completed {
                    command_id,
                    exit_code: None,
                    interrupted: true,
                    error: None,
                })
                .await;
            self.set_state(WrapperState::Ready, "interrupted").await;
            true
        } else {
            if let Some(ref mut active) = self.active {
                active.interrupted = true;
            }
            if let Some(mut child) = self.child.take() {
                child.graceful_stop(self.profile.stop_signal, Duration::from_secs(1)).await;
            }
            self.child_pid.store(0, Ordering::Release);
            if let Some(active) = self.active.take() {
                let _ = self
                    .events
                    .send(WrapperEvent::Completed {
                        command_id: active.command_id,
                        exit_code: None,
                        interrupted: true,
                        error: None,
                    })
                    .await;
            }
            self.set_state(WrapperState::Ready, "interrupted").await;
            true
        }
    }

    // -- stream handling ----------------------------------------------------

    async fn on_stream(&mut self, stream: StreamKind, bytes: &[u8]) {
        let chunks = match stream {
            StreamKind::Stdout => self.stdout_scanner.push(bytes),
            StreamKind::Stderr => self.stderr_scanner.push(bytes),
        };
        self.handle_chunks(stream, chunks).await;
    }

    async fn on_flush(&mut self) {
        let stdout = self.stdout_scanner.flush();
        self.handle_chunks(StreamKind::Stdout, stdout).await;
        let stderr = self.stderr_scanner.flush();
        self.handle_chunks(StreamKind::Stderr, stderr).await;
    }

    async fn handle_chunks(&mut self, stream: StreamKind, chunks: Vec<ScannedChunk>) {
        for chunk in chunks {
            // Readiness detection while connecting.
            if self.state == WrapperState::Connecting
                && stream == StreamKind::Stdout
                && self.profile.ready_sentinels.iter().any(|s| chunk.data.contains(s))
            {
                self.ready_deadline = None;
                self.restart_backoff.reset();
                self.health_failures = 0;
                self.set_state(WrapperState::Ready, "ready sentinel").await;
                continue;
            }

            let Some(active) = self.active.as_mut() else {
                // Idle chatter from the child is not command output.
                continue;
            };

            // Interactive completion: the prompt came back.
            if stream == StreamKind::Stdout {
                if let Some(ref sentinel) = self.profile.prompt_sentinel {
                    if chunk.data.contains(sentinel) {
                        let command_id = active.command_id;
                        let interrupted = active.interrupted;
                        self.active = None;
                        let _ = self
                            .events
                            .send(WrapperEvent::Completed {
                                command_id,
                                exit_code: if interrupted { None } else { Some(0) },
                                interrupted,
                                error: None,
                            })
                            .await;
                        self.set_state(WrapperState::Ready, "prompt returned").await;
                        continue;
                    }
                }
            }

            active.sequence += 1;
            let sequence = active.sequence;
            let command_id = active.command_id;
            let _ = self
                .events
                .send(WrapperEvent::Output { command_id, stream, sequence, chunk })
                .await;
        }
    }

    // -- health -------------------------------------------------------------

    async fn check_ready_deadline(&mut self) -> Result<(), SupervisorExit> {
        let expired = self.ready_deadline.is_some_and(|d| Instant::now() >= d);
        if !expired || self.state != WrapperState::Connecting {
            return Ok(());
        }
        self.ready_deadline = None;
        let _ = self
            .events
            .send(WrapperEvent::Fault {
                code: "READY_TIMEOUT".to_owned(),
                message: "child did not become ready within 30s".to_owned(),
            })
            .await;
        if let Some(mut child) = self.child.take() {
            child.kill().await;
        }
        self.child_pid.store(0, Ordering::Release);
        self.schedule_restart("ready timeout").await.map(|_| ())
    }

    /// Every 10s: the child must still be alive and within resource bounds.
    /// Three consecutive failures restart it.
    async fn on_health_check(&mut self) -> Result<(), SupervisorExit> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let alive = child.is_alive();
        let healthy = alive && resource_ok(child.pid, self.config.max_memory_mb);
        if healthy {
            self.health_failures = 0;
            return Ok(());
        }
        self.health_failures += 1;
        tracing::warn!(failures = self.health_failures, alive, "health check failed");
        if self.health_failures < MAX_HEALTH_FAILURES {
            return Ok(());
        }
        self.health_failures = 0;
        let _ = self
            .events
            .send(WrapperEvent::Fault {
                code: "HEALTH_CHECK".to_owned(),
                message: "health checks failed three times".to_owned(),
            })
            .await;
        if let Some(mut child) = self.child.take() {
            child.kill().await;
        }
        self.child_pid.store(0, Ordering::Release);
        if self.profile.interactive {
            self.schedule_restart("health check").await.map(|_| ())
        } else {
            Ok(())
        }
    }
}

/// Resident memory within bounds, best effort (/proc on Linux).
fn resource_ok(pid: Option<u32>, max_memory_mb: u64) -> bool {
    #[cfg(target_os = "linux")]
    {
        let Some(pid) = pid else {
            return true;
        };
        let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
            return true;
        };
        let rss_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let rss_bytes = rss_pages * 4096;
        rss_bytes <= max_memory_mb * 1024 * 1024
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (pid, max_memory_mb);
        true
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
