//! # Circuit Breaker
//!
//! Purpose: Stop hammering an unhealthy peer by short-circuiting sends
//! after the recent failure rate crosses a threshold.
//!
//! ## Design Principles
//! 1. **Sliding Window**: Only the last N outcomes matter; old history
//!    cannot keep a circuit open.
//! 2. **Minimum Sample**: The rate is not evaluated until enough calls
//!    have been observed, so a single early failure cannot trip it.
//! 3. **Half-Open Probe**: After the cooldown exactly one probe is let
//!    through; its outcome decides between closing and re-opening.
//! 4. **One Outcome Per Send**: A retried logical send is recorded once,
//!    never once per attempt.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Breaker tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Number of recent outcomes kept in the sliding window.
    pub window: usize,
    /// Minimum outcomes before the failure rate is evaluated.
    pub min_calls: usize,
    /// Failure rate at or above which the circuit opens.
    pub failure_rate: f64,
    /// How long the circuit stays open before allowing a probe.
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window: 10,
            min_calls: 5,
            failure_rate: 0.5,
            open_for: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-peer circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: BreakerState::Closed,
            outcomes: VecDeque::with_capacity(config.window),
            opened_at: None,
        }
    }

    /// Asks whether a send may proceed at `now`.
    ///
    /// While open this returns false until the cooldown elapses, then lets
    /// exactly one probe through (half-open).
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_for {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records the outcome of one logical send.
    pub fn record(&mut self, success: bool, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                if success {
                    self.state = BreakerState::Closed;
                    self.outcomes.clear();
                    self.opened_at = None;
                } else {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
            BreakerState::Closed => {
                self.outcomes.push_back(success);
                while self.outcomes.len() > self.config.window {
                    self.outcomes.pop_front();
                }
                if self.outcomes.len() >= self.config.min_calls && self.rate() >= self.config.failure_rate
                {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.outcomes.clear();
                }
            }
            // Late completion of a send that started before the circuit
            // opened; the window was already reset.
            BreakerState::Open => {}
        }
    }

    /// Returns true while sends are being short-circuited.
    pub fn is_open(&self) -> bool {
        self.state != BreakerState::Closed
    }

    fn rate(&self) -> f64 {
        let failures = self.outcomes.iter().filter(|success| !**success).count();
        failures as f64 / self.outcomes.len() as f64
    }
}
