// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry policy: classifies failures and decides retry vs. surface.
//!
//! Pure decision object — it never sleeps and never touches I/O. The
//! dispatcher asks [`RetryPolicy::should_retry`] after every failure and
//! schedules the re-enqueue itself using [`RetryPolicy::next_delay`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ErrorKind;
use crate::store::epoch_ms;

/// Retry classes with distinct budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    RateLimit,
    LockConflict,
    Network,
    Auth,
    Default,
}

impl RetryClass {
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::RateLimit => Self::RateLimit,
            ErrorKind::LockHeld => Self::LockConflict,
            ErrorKind::Network | ErrorKind::StoreUnavailable => Self::Network,
            ErrorKind::Auth => Self::Auth,
            _ => Self::Default,
        }
    }

    fn policy(&self) -> ClassPolicy {
        match self {
            Self::RateLimit => ClassPolicy { max_retries: 5, base_delay_ms: 60_000, factor: 2.0 },
            // Lock conflicts resolve through the next poll, never a tight retry.
            Self::LockConflict => ClassPolicy { max_retries: 0, base_delay_ms: 0, factor: 1.0 },
            Self::Network => ClassPolicy { max_retries: 3, base_delay_ms: 2_000, factor: 2.0 },
            Self::Auth => ClassPolicy { max_retries: 1, base_delay_ms: 30_000, factor: 1.0 },
            Self::Default => ClassPolicy { max_retries: 2, base_delay_ms: 5_000, factor: 2.0 },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClassPolicy {
    max_retries: u32,
    base_delay_ms: u64,
    factor: f64,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    attempts: u32,
    last_seen: u64,
}

/// Per-task retry accounting with idle eviction.
pub struct RetryPolicy {
    counters: Mutex<HashMap<String, Counter>>,
    max_delay: Duration,
    eviction: Duration,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            max_delay: Duration::from_secs(15 * 60),
            eviction: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_eviction(mut self, eviction: Duration) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Decide-and-charge: returns `true` and bumps the task's counter when
    /// another attempt is within the class budget.
    pub fn should_retry(&self, task_id: &str, kind: ErrorKind) -> bool {
        let policy = RetryClass::from_kind(kind).policy();
        if policy.max_retries == 0 {
            return false;
        }
        let now = epoch_ms();
        let mut counters = self.counters.lock();
        Self::evict_locked(&mut counters, now, self.eviction);
        let counter = counters
            .entry(task_id.to_owned())
            .or_insert(Counter { attempts: 0, last_seen: now });
        counter.last_seen = now;
        if counter.attempts >= policy.max_retries {
            return false;
        }
        counter.attempts += 1;
        true
    }

    /// `min(base · factor^attempts, max_delay)` plus ±10% jitter.
    pub fn next_delay(&self, task_id: &str, kind: ErrorKind) -> Duration {
        let policy = RetryClass::from_kind(kind).policy();
        let attempts = {
            let counters = self.counters.lock();
            counters.get(task_id).map(|c| c.attempts).unwrap_or(0)
        };
        let exp = policy.factor.powi(attempts.min(16) as i32);
        let raw_ms = (policy.base_delay_ms as f64 * exp).min(self.max_delay.as_millis() as f64);
        let jitter = {
            use rand::Rng;
            rand::rng().random_range(0.9..=1.1)
        };
        Duration::from_millis((raw_ms * jitter) as u64)
    }

    /// Current attempt count for a task (0 when never failed or evicted).
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.counters.lock().get(task_id).map(|c| c.attempts).unwrap_or(0)
    }

    /// Forget a task after success so later failures start fresh.
    pub fn forget(&self, task_id: &str) {
        self.counters.lock().remove(task_id);
    }

    fn evict_locked(counters: &mut HashMap<String, Counter>, now: u64, eviction: Duration) {
        let cutoff = now.saturating_sub(eviction.as_millis() as u64);
        counters.retain(|_, c| c.last_seen >= cutoff);
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
