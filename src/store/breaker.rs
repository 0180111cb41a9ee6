//! Circuit breaker guarding shared-store operations.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state machine.
///
/// closed -> open when consecutive failures reach the threshold;
/// open -> half-open once the reset timeout has elapsed;
/// half-open -> closed on one success, back to open on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Three-state circuit breaker for store operations.
///
/// Calls rejected while the breaker is open do not count as failures; only
/// attempted operations that fail (including timeouts and abandonment) do.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    ///
    /// - `failure_threshold`: consecutive failures before the breaker opens
    /// - `reset_timeout`: how long the breaker stays open before probing
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Creates a circuit breaker with default settings (5 failures, 60 s).
    pub fn with_defaults() -> Self {
        CircuitBreaker::new(5, Duration::from_secs(60))
    }

    /// Returns true if a call may proceed. An open breaker whose reset
    /// timeout has elapsed moves to half-open and admits this one trial call.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if now.duration_since(since) >= self.reset_timeout {
                    info!("circuit breaker half-open, probing store");
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful operation. Closes the breaker from any state.
    pub fn on_success(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == BreakerState::HalfOpen {
            info!("circuit breaker closed after successful probe");
        }
        *state = BreakerState::Closed { failures: 0 };
    }

    /// Records a failed operation.
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    fn on_failure_at(&self, now: Instant) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(failures, "circuit breaker opened");
                    BreakerState::Open { since: now }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            // A failed probe re-opens, restarting the reset clock.
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open { since: now },
        };
    }

    /// Current state name, for the service health endpoint.
    pub fn state_name(&self) -> &'static str {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *state {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}
