// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health metrics sampled for `agent:heartbeat`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use onsembl_protocol::messages::HealthMetrics;

/// Shared counters behind the periodic heartbeat.
pub struct MetricsState {
    started: Instant,
    commands_processed: AtomicU64,
    response_total_ms: AtomicU64,
    /// Child PID mirror maintained by the supervisor.
    child_pid: Arc<AtomicU32>,
}

impl MetricsState {
    pub fn new(child_pid: Arc<AtomicU32>) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            commands_processed: AtomicU64::new(0),
            response_total_ms: AtomicU64::new(0),
            child_pid,
        })
    }

    /// Record one finished command and its wall-clock duration.
    pub fn note_command(&self, took: Duration) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        self.response_total_ms.fetch_add(took.as_millis() as u64, Ordering::Relaxed);
    }

    /// Snapshot for one heartbeat frame.
    pub fn collect(&self) -> HealthMetrics {
        let commands = self.commands_processed.load(Ordering::Relaxed);
        let total_ms = self.response_total_ms.load(Ordering::Relaxed);
        let pid = self.child_pid.load(Ordering::Acquire);
        HealthMetrics {
            cpu_percent: sample_cpu_percent(pid),
            memory_bytes: sample_rss_bytes(pid),
            uptime_secs: self.started.elapsed().as_secs(),
            commands_processed: commands,
            average_response_ms: if commands == 0 {
                0.0
            } else {
                (total_ms as f64) / (commands as f64)
            },
        }
    }
}

/// Child resident set size, best effort (/proc on Linux, 0 elsewhere).
fn sample_rss_bytes(pid: u32) -> u64 {
    #[cfg(target_os = "linux")]
    {
        if pid == 0 {
            return 0;
        }
        let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
            return 0;
        };
        let rss_pages: u64 =
            statm.split_whitespace().nth(1).and_then(|v| v.parse().ok()).unwrap_or(0);
        rss_pages * 4096
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        0
    }
}

/// Average CPU share of the child since it started, best effort.
fn sample_cpu_percent(pid: u32) -> f64 {
    #[cfg(target_os = "linux")]
    {
        if pid == 0 {
            return 0.0;
        }
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return 0.0;
        };
        // Fields 14/15 (utime/stime) come after the parenthesized comm,
        // which may itself contain spaces.
        let Some(rest) = stat.rsplit(')').next() else {
            return 0.0;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
        let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
        let start_ticks: u64 = fields.get(19).and_then(|v| v.parse().ok()).unwrap_or(0);
        let hz = 100.0; // USER_HZ on every mainstream Linux
        let Ok(uptime) = std::fs::read_to_string("/proc/uptime") else {
            return 0.0;
        };
        let uptime_secs: f64 =
            uptime.split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let running_secs = uptime_secs - (start_ticks as f64) / hz;
        if running_secs <= 0.0 {
            return 0.0;
        }
        let used_secs = ((utime + stime) as f64) / hz;
        (used_secs / running_secs * 100.0).clamp(0.0, 100.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        0.0
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
