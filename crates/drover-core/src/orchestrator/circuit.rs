//! Spawn/task-failure circuit breaker.
//!
//! A small closed / open / half-open state machine. Consecutive failures
//! past the threshold open the circuit; while open, the orchestrator stops
//! spawning (the poll loop still observes existing workers). After the
//! cooldown one trial spawn is allowed; its outcome closes or re-opens the
//! circuit.

use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    enabled: bool,
    failure_threshold: u32,
    cooldown: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a spawn may proceed right now. An open circuit whose
    /// cooldown has elapsed transitions to half-open and allows one trial.
    pub fn allows_spawn(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    tracing::info!("circuit cooldown elapsed, allowing trial spawn");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_failure(&mut self) {
        if !self.enabled {
            return;
        }
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::HalfOpen => {
                // Trial failed; straight back to open.
                self.trip();
            }
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.trip();
            }
            _ => {}
        }
    }

    pub fn record_success(&mut self) {
        if !self.enabled {
            return;
        }
        if self.state == CircuitState::HalfOpen {
            tracing::info!("trial spawn succeeded, closing circuit");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn trip(&mut self) {
        tracing::warn!(
            failures = self.consecutive_failures,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }
}
