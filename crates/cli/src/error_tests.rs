// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::ErrorKind;

#[test]
fn as_str_is_stable() {
    assert_eq!(ErrorKind::RateLimit.as_str(), "RATE_LIMIT");
    assert_eq!(ErrorKind::LockHeld.as_str(), "LOCK_HELD");
    assert_eq!(ErrorKind::SubprocessCrash.as_str(), "SUBPROCESS_CRASH");
    assert_eq!(ErrorKind::Other.as_str(), "ERROR");
}

#[test]
fn display_matches_as_str() {
    assert_eq!(ErrorKind::Network.to_string(), "NETWORK");
}

#[test]
fn lock_held_is_never_retryable() {
    assert!(!ErrorKind::LockHeld.retryable());
}

#[test]
fn transient_kinds_are_retryable() {
    assert!(ErrorKind::RateLimit.retryable());
    assert!(ErrorKind::Network.retryable());
    assert!(ErrorKind::SubprocessCrash.retryable());
}

#[test]
fn serde_round_trip() {
    let json = serde_json::to_string(&ErrorKind::Auth).unwrap();
    let back: ErrorKind = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ErrorKind::Auth);
}
