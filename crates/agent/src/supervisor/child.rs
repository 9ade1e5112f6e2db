// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process lifecycle: spawn with piped stdio, stream capture tasks,
//! graceful stop, and liveness probes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use onsembl_protocol::StreamKind;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// How to ask a child to stop before escalating to SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Write ETX (0x03) to stdin; interactive agents treat it as interrupt.
    Etx,
    Term,
    Kill,
}

impl StopSignal {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "etx" => Some(Self::Etx),
            "term" => Some(Self::Term),
            "kill" => Some(Self::Kill),
            _ => None,
        }
    }
}

/// Signal 0 probes a PID without delivering anything; EPERM still means
/// the process exists.
pub fn pid_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// A spawned child with its stdin retained for writing.
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pub pid: Option<u32>,
}

impl ChildProcess {
    /// Spawn with piped stdio; stdout/stderr bytes arrive on the returned
    /// channel until both streams close.
    pub fn spawn(
        program: &str,
        args: &[String],
        working_directory: Option<&Path>,
        env: &[(String, String)],
    ) -> anyhow::Result<(Self, mpsc::Receiver<(StreamKind, Bytes)>)> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_directory {
            command.current_dir(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();

        let (tx, rx) = mpsc::channel::<(StreamKind, Bytes)>(64);
        if let Some(stdout) = stdout {
            spawn_reader(stdout, StreamKind::Stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_reader(stderr, StreamKind::Stderr, tx);
        }

        Ok((Self { child, stdin, pid }, rx))
    }

    /// Write to the child's stdin.
    pub async fn write_stdin(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let Some(ref mut stdin) = self.stdin else {
            anyhow::bail!("child stdin is closed");
        };
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Non-blocking exit probe.
    pub fn try_exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(_) => Some(None),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Graceful stop: deliver the configured stop signal, wait up to
    /// `timeout` for exit, then SIGKILL.
    pub async fn graceful_stop(
        &mut self,
        stop: StopSignal,
        timeout: Duration,
    ) -> Option<i32> {
        match stop {
            StopSignal::Etx => {
                let _ = self.write_stdin(&[0x03]).await;
            }
            StopSignal::Term => {
                if let Some(pid) = self.pid {
                    if let Ok(pid) = i32::try_from(pid) {
                        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
                    }
                }
            }
            StopSignal::Kill => {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                let _ = self.child.start_kill();
                match self.child.wait().await {
                    Ok(status) => status.code(),
                    Err(_) => None,
                }
            }
        }
    }

    /// Hard kill, no grace.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn spawn_reader<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, Bytes)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "child_tests.rs"]
mod tests;
