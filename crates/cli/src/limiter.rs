// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-channel rate limit tracking with bounded back-off holds.
//!
//! The forge client records response headers and 429s here; the dispatcher
//! consults [`RateLimiter::check`] before polling and before dequeueing,
//! and parks in [`RateLimiter::wait_with_backoff`] when a task trips a
//! limit mid-flight.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Classify, ErrorKind};
use crate::store::epoch_ms;

/// API channels with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Forge,
    Agent,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forge => "forge",
            Self::Agent => "agent",
        }
    }
}

/// Answer from [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitCheck {
    pub limited: bool,
    pub wait: Duration,
}

impl LimitCheck {
    fn clear() -> Self {
        Self { limited: false, wait: Duration::ZERO }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("retry budget exhausted for {task_id} after {attempts} attempts")]
    RetryExhausted { task_id: String, attempts: u32 },
}

impl Classify for LimiterError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::RateLimit
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelLimit {
    remaining: Option<u64>,
    /// Epoch ms at which the limit resets; 0 = unknown.
    reset_at: u64,
}

/// Tracks `{remaining, reset_at}` per channel and per-task back-off
/// counters.
pub struct RateLimiter {
    channels: Mutex<HashMap<Channel, ChannelLimit>>,
    backoff: Mutex<HashMap<String, u32>>,
    base_delay: Duration,
    max_attempts: u32,
    /// Assumed hold when a 429 arrives without a reset header.
    default_hold: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            default_hold: Duration::from_secs(60),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_default_hold(mut self, default_hold: Duration) -> Self {
        self.default_hold = default_hold;
        self
    }

    /// Record limit headers from a successful response.
    pub fn record_headers(&self, channel: Channel, remaining: u64, reset_at: u64) {
        let mut channels = self.channels.lock();
        channels.insert(channel, ChannelLimit { remaining: Some(remaining), reset_at });
    }

    /// Record a hard limit hit (429-class response). `reset_at` in epoch
    /// ms; when absent the default hold applies.
    pub fn record_limited(&self, channel: Channel, reset_at: Option<u64>) {
        let reset_at = reset_at.unwrap_or_else(|| epoch_ms() + self.default_hold.as_millis() as u64);
        let mut channels = self.channels.lock();
        channels.insert(channel, ChannelLimit { remaining: Some(0), reset_at });
        warn!(channel = channel.as_str(), reset_at, "rate limit hit");
    }

    /// Whether the channel is currently limited, and for how long.
    pub fn check(&self, channel: Channel) -> LimitCheck {
        let channels = self.channels.lock();
        let Some(limit) = channels.get(&channel) else {
            return LimitCheck::clear();
        };
        if limit.remaining != Some(0) {
            return LimitCheck::clear();
        }
        let now = epoch_ms();
        if limit.reset_at <= now {
            return LimitCheck::clear();
        }
        LimitCheck { limited: true, wait: Duration::from_millis(limit.reset_at - now) }
    }

    /// Park the caller with exponential back-off, charged to `task_id`.
    ///
    /// The per-task counter is capped; past the cap the error surfaces so
    /// the retry policy can give up on the task instead of spinning.
    pub async fn wait_with_backoff(&self, task_id: &str, reason: &str) -> Result<(), LimiterError> {
        let attempts = {
            let backoff = self.backoff.lock();
            backoff.get(task_id).copied().unwrap_or(0)
        };
        if attempts >= self.max_attempts {
            return Err(LimiterError::RetryExhausted { task_id: task_id.to_owned(), attempts });
        }

        let delay = self.base_delay.saturating_mul(1u32 << attempts.min(16));
        info!(task_id, reason, attempt = attempts + 1, delay_ms = delay.as_millis() as u64,
            "backing off");
        tokio::time::sleep(delay).await;

        let mut backoff = self.backoff.lock();
        *backoff.entry(task_id.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    /// Clear the back-off counter after a task-level success.
    pub fn reset_backoff(&self, task_id: &str) {
        self.backoff.lock().remove(task_id);
    }

    /// Log the limits observed so far. The forge client records headers on
    /// every call, so running any cheap request before this gives a real
    /// startup probe.
    pub fn preflight(&self) {
        for channel in [Channel::Forge, Channel::Agent] {
            let check = self.check(channel);
            if check.limited {
                warn!(channel = channel.as_str(), wait_ms = check.wait.as_millis() as u64,
                    "channel limited at startup");
            } else {
                info!(channel = channel.as_str(), "channel clear at startup");
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
