// Service hardening
//
// Request-path guards for the HTTP surface:
// - FixedWindowLimiter: per-endpoint request budgets (scan and reload
//   have separate limiters with separate windows)
// - CircuitBreaker: opens after a run of consecutive scan failures and
//   rejects requests until the reset window elapses; the first request
//   after the window is a half-open probe that closes the breaker on
//   success and reopens it on failure
//
// Both guards are process-local and lock-light: one short-lived mutex
// acquisition per request, no locks held across await points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ServerConfig;

// ---------------------------------------------------------------------------
// Fixed-window rate limiter
// ---------------------------------------------------------------------------

/// Counts requests against a capacity inside a fixed window. The window
/// resets lazily on the first request after it elapses.
pub struct FixedWindowLimiter {
    capacity: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one slot from the current window. Returns false when the
    /// window budget is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count < self.capacity {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Trips after `failure_threshold` consecutive failures and stays open
/// for `reset_after`. Success at any point closes it and clears the
/// failure streak.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold,
            reset_after,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Whether a request may proceed. Once the reset window has elapsed
    /// the breaker lets requests through again (half-open); the next
    /// recorded outcome decides whether it closes or reopens.
    pub fn allow(&self) -> bool {
        let state = self.state.lock();
        match state.open_until {
            Some(open_until) => Instant::now() >= open_until,
            None => true,
        }
    }

    /// Record a failed scan. Returns true when this failure tripped the
    /// breaker open (including a failed half-open probe reopening it).
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.failure_threshold {
            let was_closed = state
                .open_until
                .map_or(true, |open_until| Instant::now() >= open_until);
            state.open_until = Some(Instant::now() + self.reset_after);
            was_closed
        } else {
            false
        }
    }

    /// Record a successful scan: closes the breaker and clears the streak.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn is_open(&self) -> bool {
        !self.allow()
    }
}

// ---------------------------------------------------------------------------
// Bundle wired into the router state
// ---------------------------------------------------------------------------

pub struct ServiceGuards {
    pub scan_limiter: FixedWindowLimiter,
    pub reload_limiter: FixedWindowLimiter,
    pub breaker: CircuitBreaker,
}

impl ServiceGuards {
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            scan_limiter: FixedWindowLimiter::new(
                config.scan_rate_limit_per_minute,
                Duration::from_secs(60),
            ),
            reload_limiter: FixedWindowLimiter::new(
                config.reload_rate_limit_per_hour,
                Duration::from_secs(3600),
            ),
            breaker: CircuitBreaker::new(
                config.circuit_breaker_failure_threshold,
                Duration::from_millis(config.circuit_breaker_reset_ms),
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
