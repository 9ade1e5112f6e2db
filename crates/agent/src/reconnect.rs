// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnection policy: exponential backoff with jitter, wrapped by a
//! circuit breaker.
//!
//! The breaker opens after five consecutive failures and stays open for a
//! cool-down; one half-open trial then decides whether it closes again.
//! State changes are observable through a watch channel so the supervisor
//! can surface them.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Exponential backoff schedule: base, base*2, base*4, ... capped.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max: Duration::from_secs(30), max_attempts, attempt: 0 }
    }

    /// The next delay, or `None` once attempts are exhausted.
    /// Jitter of ±20% keeps a fleet of wrappers from thundering back in
    /// lockstep.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        self.attempt += 1;
        let capped = exp.min(self.max);
        let jitter = rand::rng().random_range(0.8..1.2);
        Some(capped.mul_f64(jitter))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}

/// Circuit breaker state, observable via [`CircuitBreaker::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_cooldown(BREAKER_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        let (tx, _) = watch::channel(BreakerState::Closed);
        Self { state: BreakerState::Closed, consecutive_failures: 0, opened_at: None, cooldown, tx }
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<BreakerState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    fn transition(&mut self, next: BreakerState) {
        if self.state != next {
            tracing::info!(from = self.state.as_str(), to = next.as_str(), "circuit breaker");
            self.state = next;
            let _ = self.tx.send(next);
        }
    }

    /// Whether a connection attempt may proceed right now. An open breaker
    /// past its cool-down moves to half-open and admits a single trial.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled =
                    self.opened_at.is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    self.transition(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.transition(BreakerState::Closed);
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        match self.state {
            // A failed half-open trial re-opens immediately.
            BreakerState::HalfOpen => {
                self.opened_at = Some(Instant::now());
                self.transition(BreakerState::Open);
            }
            BreakerState::Closed if self.consecutive_failures >= BREAKER_THRESHOLD => {
                self.opened_at = Some(Instant::now());
                self.transition(BreakerState::Open);
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "reconnect_tests.rs"]
mod tests;
