//! Per-provider circuit breaker.
//!
//! Closed: calls pass and outcomes are recorded in a rolling window. Once
//! the window holds at least `minimum_calls` outcomes and the failure
//! ratio reaches `failure_ratio`, the breaker opens. Open: calls are
//! refused until `cooldown_ms` has elapsed, then a single probe is let
//! through (half-open). The probe's outcome closes or re-opens it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Breaker tuning, part of each provider's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of most recent calls considered
    pub window_size: usize,
    /// Failure share in `[0, 1]` that trips the breaker
    pub failure_ratio: f64,
    /// Calls needed in the window before the ratio is evaluated
    pub minimum_calls: usize,
    /// Time spent open before a half-open probe
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_ratio: 0.5,
            minimum_calls: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// `true` = success
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window_size.max(1)),
                opened_at: None,
                probe_in_flight: false,
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask permission for one call. Moves Open → HalfOpen once the
    /// cooldown has passed and hands out exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed() >= Duration::from_millis(self.config.cooldown_ms));
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("[CircuitBreaker] {} half-open, probing", self.name);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                info!("[CircuitBreaker] {} closed after successful probe", self.name);
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            _ => self.push(&mut inner, true),
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("[CircuitBreaker] {} probe failed, re-opening", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                self.push(&mut inner, false);
                let calls = inner.window.len();
                let failures = inner.window.iter().filter(|ok| !**ok).count();
                if calls >= self.config.minimum_calls
                    && failures as f64 / calls as f64 >= self.config.failure_ratio
                {
                    warn!(
                        "[CircuitBreaker] {} opened: {}/{} recent calls failed",
                        self.name, failures, calls
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    fn push(&self, inner: &mut Inner, outcome: bool) {
        if inner.window.len() >= self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(outcome);
    }
}
