// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::limiter::RateLimiter;

fn forge() -> HttpForge {
    let _ = rustls::crypto::ring::default_provider().install_default();
    HttpForge::new(
        "https://forge.example/api/v3/",
        "alice",
        "widgets",
        "token",
        Arc::new(RateLimiter::new()),
    )
}

#[test]
fn url_joins_repo_path() {
    let forge = forge();
    assert_eq!(
        forge.url("/issues/42/comments"),
        "https://forge.example/api/v3/repos/alice/widgets/issues/42/comments"
    );
}

#[test]
fn trailing_slash_in_base_url_is_trimmed() {
    let forge = forge();
    assert!(!forge.url("/issues").contains("//repos"));
}

#[test]
fn reset_header_converts_seconds_to_ms() {
    assert_eq!(reset_header_to_ms(Some("1700000000")), Some(1_700_000_000_000));
    assert_eq!(reset_header_to_ms(Some("nonsense")), None);
    assert_eq!(reset_header_to_ms(None), None);
}

#[test]
fn wire_issue_maps_to_issue() {
    let wire: WireIssue = serde_json::from_value(serde_json::json!({
        "number": 42,
        "title": "broken build",
        "body": "hello",
        "labels": [{"name": "task:misc"}, {"name": "bug"}],
        "user": {"login": "alice"},
        "state": "open",
    }))
    .unwrap();
    let issue = issue_from_wire(wire);
    assert_eq!(issue.number, 42);
    assert_eq!(issue.labels, vec!["task:misc", "bug"]);
    assert_eq!(issue.author, "alice");
    assert!(issue.is_open());
    assert!(issue.has_label("bug"));
}

#[test]
fn null_body_becomes_empty_string() {
    let wire: WireIssue = serde_json::from_value(serde_json::json!({
        "number": 1,
        "title": "t",
        "body": null,
        "labels": [],
        "user": {"login": "alice"},
        "state": "open",
    }))
    .unwrap();
    assert_eq!(issue_from_wire(wire).body, "");
}

#[test]
fn pull_request_marker_survives_parsing() {
    let wire: WireIssue = serde_json::from_value(serde_json::json!({
        "number": 2,
        "title": "a pr",
        "labels": [],
        "user": {"login": "alice"},
        "state": "open",
        "pull_request": {"url": "https://forge.example/pr/2"},
    }))
    .unwrap();
    assert!(wire.pull_request.is_some());
}
