//! Circuit Breaker
//!
//! Per-provider failure isolation. `closed` admits traffic; enough
//! failures inside the rolling window trip it to `open`; after the
//! cooldown it moves to `half-open` and admits a single probe. A probe
//! success closes the breaker, a probe failure reopens it.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use taskmesh_types::{BreakerPolicy, BreakerState};

/// State transition worth an event in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: BreakerState,
    /// Failure timestamps still inside the rolling window.
    window: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: BreakerState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn window_failures(&self) -> Vec<DateTime<Utc>> {
        self.window.iter().copied().collect()
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::milliseconds(self.policy.window_ms as i64);
        while self.window.front().is_some_and(|t| *t < horizon) {
            self.window.pop_front();
        }
    }

    /// Whether this breaker admits a request right now. Admitting the
    /// half-open probe claims the probe slot.
    pub fn try_admit(&mut self, _now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Release a claimed probe slot without an outcome (the assignment was
    /// abandoned before dispatch).
    pub fn abort_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Record a success. Closes a half-open breaker.
    pub fn on_success(&mut self, _now: DateTime<Utc>) -> Option<BreakerEvent> {
        self.probe_in_flight = false;
        self.window.clear();
        if self.state != BreakerState::Closed {
            self.state = BreakerState::Closed;
            self.opened_at = None;
            return Some(BreakerEvent::Closed);
        }
        None
    }

    /// Record a failure. Trips a closed breaker once the windowed count
    /// reaches the threshold; reopens a half-open breaker immediately.
    pub fn on_failure(&mut self, now: DateTime<Utc>) -> Option<BreakerEvent> {
        self.probe_in_flight = false;
        match self.state {
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                Some(BreakerEvent::Opened)
            }
            BreakerState::Closed => {
                self.window.push_back(now);
                self.prune(now);
                if self.window.len() as u32 >= self.policy.consecutive_failures {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.window.clear();
                    Some(BreakerEvent::Opened)
                } else {
                    None
                }
            }
        }
    }

    /// Advance time: an open breaker past its cooldown becomes half-open.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<BreakerEvent> {
        if self.state == BreakerState::Open {
            let cooled = self
                .opened_at
                .is_some_and(|t| now - t >= Duration::milliseconds(self.policy.cooldown_ms as i64));
            if cooled {
                self.state = BreakerState::HalfOpen;
                self.probe_in_flight = false;
                return Some(BreakerEvent::HalfOpened);
            }
        }
        None
    }

    /// Rebuild from persisted state. Half-open collapses back to open: the
    /// probe that justified half-open did not survive the restart.
    pub fn restore(
        policy: BreakerPolicy,
        state: BreakerState,
        window: Vec<DateTime<Utc>>,
        opened_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, opened_at) = match state {
            BreakerState::HalfOpen => (BreakerState::Open, opened_at.or(Some(now))),
            other => (other, opened_at),
        };
        Self {
            policy,
            state,
            window: window.into(),
            opened_at,
            probe_in_flight: false,
        }
    }
}
