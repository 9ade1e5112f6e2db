// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent command queue: three FIFO lanes polled in strict priority order.

use std::collections::VecDeque;

use onsembl_protocol::epoch_ms;
use onsembl_protocol::messages::{CommandRequest, QueueEntry};
use onsembl_protocol::CommandPriority;
use uuid::Uuid;

/// A command waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub request: CommandRequest,
    /// Connection that submitted the command (gone after reconnects).
    pub requester_conn: Option<Uuid>,
    pub principal: String,
    pub submitted_ms: i64,
}

impl QueuedCommand {
    pub fn new(request: CommandRequest, requester_conn: Option<Uuid>, principal: String) -> Self {
        Self { request, requester_conn, principal, submitted_ms: epoch_ms() }
    }

    pub fn command_id(&self) -> Uuid {
        self.request.command_id
    }
}

/// Three FIFO sub-queues. High is always drained before normal, normal
/// before low; within a lane order is submission order.
#[derive(Debug, Default)]
pub struct AgentQueue {
    high: VecDeque<QueuedCommand>,
    normal: VecDeque<QueuedCommand>,
    low: VecDeque<QueuedCommand>,
}

impl AgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&mut self, priority: CommandPriority) -> &mut VecDeque<QueuedCommand> {
        match priority {
            CommandPriority::High => &mut self.high,
            CommandPriority::Normal => &mut self.normal,
            CommandPriority::Low => &mut self.low,
        }
    }

    /// Enqueue at the back of the command's priority lane; returns the
    /// overall queue position (0 = next to dispatch).
    pub fn push(&mut self, cmd: QueuedCommand) -> usize {
        let priority = cmd.request.priority;
        self.lane(priority).push_back(cmd);
        match priority {
            CommandPriority::High => self.high.len() - 1,
            CommandPriority::Normal => self.high.len() + self.normal.len() - 1,
            CommandPriority::Low => self.len() - 1,
        }
    }

    /// Re-enqueue held commands at the *front* of their priority lanes,
    /// preserving their relative order (back-pressure recovery).
    pub fn requeue_front(&mut self, held: Vec<QueuedCommand>) {
        for cmd in held.into_iter().rev() {
            let priority = cmd.request.priority;
            self.lane(priority).push_front(cmd);
        }
    }

    /// Pop the head: the oldest command of the highest non-empty priority.
    pub fn pop_head(&mut self) -> Option<QueuedCommand> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    pub fn peek_head(&self) -> Option<&QueuedCommand> {
        self.high.front().or_else(|| self.normal.front()).or_else(|| self.low.front())
    }

    /// Remove a queued command wherever it sits.
    pub fn remove(&mut self, command_id: Uuid) -> Option<QueuedCommand> {
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(idx) = lane.iter().position(|c| c.command_id() == command_id) {
                return lane.remove(idx);
            }
        }
        None
    }

    /// Remove everything, in dispatch order.
    pub fn drain(&mut self) -> Vec<QueuedCommand> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.high.drain(..));
        out.extend(self.normal.drain(..));
        out.extend(self.low.drain(..));
        out
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire-format snapshot for `command:queue`.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .enumerate()
            .map(|(position, cmd)| QueueEntry {
                command_id: cmd.command_id(),
                priority: cmd.request.priority,
                position,
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
