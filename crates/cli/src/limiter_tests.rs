// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::store::epoch_ms;

#[test]
fn unknown_channel_is_clear() {
    let limiter = RateLimiter::new();
    assert!(!limiter.check(Channel::Forge).limited);
}

#[test]
fn remaining_budget_is_clear() {
    let limiter = RateLimiter::new();
    limiter.record_headers(Channel::Forge, 57, epoch_ms() + 60_000);
    assert!(!limiter.check(Channel::Forge).limited);
}

#[test]
fn zero_remaining_is_limited_until_reset() {
    let limiter = RateLimiter::new();
    limiter.record_headers(Channel::Forge, 0, epoch_ms() + 60_000);
    let check = limiter.check(Channel::Forge);
    assert!(check.limited);
    assert!(check.wait > Duration::from_secs(50));
    assert!(check.wait <= Duration::from_secs(60));
}

#[test]
fn limit_expires_after_reset() {
    let limiter = RateLimiter::new();
    limiter.record_headers(Channel::Forge, 0, epoch_ms().saturating_sub(1000));
    assert!(!limiter.check(Channel::Forge).limited);
}

#[test]
fn record_limited_without_reset_uses_default_hold() {
    let limiter = RateLimiter::new().with_default_hold(Duration::from_secs(30));
    limiter.record_limited(Channel::Agent, None);
    let check = limiter.check(Channel::Agent);
    assert!(check.limited);
    assert!(check.wait <= Duration::from_secs(30));
}

#[test]
fn channels_are_independent() {
    let limiter = RateLimiter::new();
    limiter.record_limited(Channel::Forge, Some(epoch_ms() + 60_000));
    assert!(limiter.check(Channel::Forge).limited);
    assert!(!limiter.check(Channel::Agent).limited);
}

#[tokio::test]
async fn backoff_counts_up_and_exhausts() {
    let limiter = RateLimiter::new().with_base_delay(Duration::from_millis(1));
    for _ in 0..5 {
        limiter.wait_with_backoff("issue-1", "test").await.unwrap();
    }
    let err = limiter.wait_with_backoff("issue-1", "test").await.unwrap_err();
    assert!(matches!(err, LimiterError::RetryExhausted { attempts: 5, .. }));
}

#[tokio::test]
async fn backoff_reset_restores_budget() {
    let limiter = RateLimiter::new().with_base_delay(Duration::from_millis(1));
    for _ in 0..5 {
        limiter.wait_with_backoff("issue-2", "test").await.unwrap();
    }
    limiter.reset_backoff("issue-2");
    limiter.wait_with_backoff("issue-2", "test").await.unwrap();
}

#[tokio::test]
async fn backoff_counters_are_per_task() {
    let limiter = RateLimiter::new().with_base_delay(Duration::from_millis(1));
    for _ in 0..5 {
        limiter.wait_with_backoff("issue-3", "test").await.unwrap();
    }
    // A different task still has its full budget.
    limiter.wait_with_backoff("issue-4", "test").await.unwrap();
}
