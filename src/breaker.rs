use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker guarding one backend connection.
///
/// Constructed once and injected wherever the connection is used; every call
/// outcome feeds back into it and every call consults it first.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time breaker state for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: &'static str,
    pub is_open: bool,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            state: Mutex::new(BreakerState::Closed),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Whether the next call may reach the backend. While open, returns
    /// false until the reset timeout has elapsed; then exactly one caller is
    /// let through as the trial and the breaker moves to half-open.
    pub fn allows_call(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .lock()
                    .unwrap()
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    *state = BreakerState::HalfOpen;
                    info!("circuit breaker half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::HalfOpen => {
                *state = BreakerState::Closed;
                self.failure_count.store(0, Ordering::Relaxed);
                info!("circuit breaker closed after successful trial call");
            }
            BreakerState::Closed => {
                // Successes bleed the count down one at a time; a mixed
                // success/failure stream cannot flap the breaker.
                let _ = self
                    .failure_count
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure.lock().unwrap() = Some(Instant::now());

        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::HalfOpen => {
                *state = BreakerState::Open;
                warn!("circuit breaker re-opened: trial call failed");
            }
            BreakerState::Closed if count >= self.failure_threshold => {
                *state = BreakerState::Open;
                warn!("circuit breaker opened after {} failures", count);
            }
            _ => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), BreakerState::Open)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = *self.state.lock().unwrap();
        BreakerSnapshot {
            state: state.as_str(),
            is_open: state == BreakerState::Open,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
        }
    }
}
