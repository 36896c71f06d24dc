// ABOUTME: Per-backend circuit breaker and the shared breaker table
// ABOUTME: Opens after N failures, admits trials once the reset window has elapsed

use crate::types::BackendName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Stored breaker state. There is deliberately no half-open variant: a trial
/// is admitted by `can_request` reading an open breaker whose window elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Threshold and reset window shared by every breaker in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only view of a breaker for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    opened_at: Option<Instant>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            failure_count: 0,
            opened_at: None,
            // A zero threshold would leave the breaker permanently open
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                ..settings
            },
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.opened_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Whether a request may go to this backend at `now`. Pure read.
    pub fn can_request(&self, now: Instant) -> bool {
        match self.opened_at {
            None => true,
            Some(opened_at) => {
                now.saturating_duration_since(opened_at) >= self.settings.reset_timeout
            }
        }
    }

    /// Record a failed attempt. Returns true if this call opened the breaker.
    pub fn mark_failure(&mut self, now: Instant) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count < self.settings.failure_threshold {
            return false;
        }
        let newly_opened = self.opened_at.is_none();
        // Failures while open push the window out, so a failed trial re-arms it
        self.opened_at = Some(now);
        newly_opened
    }

    /// Record a successful attempt. Returns true if the breaker was open.
    pub fn mark_success(&mut self) -> bool {
        let was_open = self.opened_at.is_some();
        self.failure_count = 0;
        self.opened_at = None;
        was_open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            failure_count: self.failure_count,
        }
    }
}

/// One breaker per backend, each behind its own lock so that requests racing
/// on the same backend serialize while different backends stay independent.
#[derive(Debug)]
pub struct BreakerTable {
    breakers: HashMap<BackendName, Mutex<CircuitBreaker>>,
}

impl BreakerTable {
    pub fn new(settings: BreakerSettings) -> Self {
        let breakers = BackendName::ALL
            .into_iter()
            .map(|name| (name, Mutex::new(CircuitBreaker::new(settings))))
            .collect();
        Self { breakers }
    }

    fn lock(&self, name: BackendName) -> Option<MutexGuard<'_, CircuitBreaker>> {
        self.breakers
            .get(&name)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn can_request(&self, name: BackendName, now: Instant) -> bool {
        self.lock(name).map(|b| b.can_request(now)).unwrap_or(true)
    }

    pub fn mark_failure(&self, name: BackendName, now: Instant) {
        let Some(mut breaker) = self.lock(name) else {
            return;
        };
        if breaker.mark_failure(now) {
            tracing::warn!(
                backend = %name,
                failures = breaker.snapshot().failure_count,
                reset_ms = breaker.settings.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        } else {
            tracing::debug!(
                backend = %name,
                failures = breaker.snapshot().failure_count,
                "Recorded backend failure"
            );
        }
    }

    pub fn mark_success(&self, name: BackendName) {
        let Some(mut breaker) = self.lock(name) else {
            return;
        };
        if breaker.mark_success() {
            tracing::info!(backend = %name, "Circuit breaker closed after successful trial");
        }
    }

    pub fn snapshot(&self, name: BackendName) -> Option<BreakerSnapshot> {
        self.lock(name).map(|b| b.snapshot())
    }

    /// Snapshots for every backend, in `BackendName::ALL` order.
    pub fn snapshots(&self) -> Vec<(BackendName, BreakerSnapshot)> {
        BackendName::ALL
            .into_iter()
            .filter_map(|name| self.snapshot(name).map(|s| (name, s)))
            .collect()
    }
}

impl Default for BreakerTable {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
