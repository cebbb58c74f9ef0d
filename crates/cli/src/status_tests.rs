// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::labels::list_requests;
use crate::store::{StateStore, StorePaths};

fn manager() -> (tempfile::TempDir, Arc<StateStore>, StatusManager) {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::new(dir.path().join("state"), dir.path().join("temp"));
    paths.ensure().unwrap();
    let store = Arc::new(StateStore::new(paths));
    let manager = StatusManager::new(Arc::clone(&store));
    (dir, store, manager)
}

#[test]
fn checkout_from_idle_sets_processing() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    let record = mgr.get(42).unwrap();
    assert_eq!(record.state, IssueState::Processing);
    assert_eq!(record.process_id.as_deref(), Some("issue-42"));
    assert!(record.last_heartbeat.is_some());
}

#[test]
fn checkout_emits_processing_label_request() {
    let (_dir, store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    let pending = list_requests(store.paths());
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.add_labels, vec![LABEL_PROCESSING]);
    assert_eq!(pending[0].request.remove_labels, vec![LABEL_AWAITING_RESPONSE]);
}

#[test]
fn checkout_while_processing_is_rejected() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    let err = mgr.checkout(42, "issue-42-comment-1", "follow-up").unwrap_err();
    assert!(matches!(err, StatusError::InvalidTransition { issue_id: 42, from: "processing" }));
}

#[test]
fn checkout_from_awaiting_response_is_allowed() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::AwaitingResponse, None).unwrap();
    mgr.checkout(42, "issue-42-comment-1", "follow-up").unwrap();
    assert_eq!(mgr.state_of(42), IssueState::Processing);
}

#[test]
fn checkin_completed_leaves_no_processing_label_request_pending() {
    let (_dir, store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::Completed, Some("done".to_owned())).unwrap();

    let record = mgr.get(42).unwrap();
    assert_eq!(record.state, IssueState::Completed);
    assert!(record.ended_at.is_some());
    assert_eq!(record.result.as_deref(), Some("done"));

    // Two requests: checkout then checkin; the checkin removes processing.
    let pending = list_requests(store.paths());
    assert_eq!(pending.len(), 2);
    let checkin = &pending[1].request;
    assert_eq!(checkin.add_labels, vec![LABEL_COMPLETED]);
    assert_eq!(checkin.remove_labels, vec![LABEL_PROCESSING]);
}

#[test]
fn checkin_error_bumps_retry_count() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::Error, Some("boom".to_owned())).unwrap();
    assert_eq!(mgr.get(42).unwrap().retry_count, 1);
}

#[test]
fn error_then_reset_returns_to_idle() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::Error, None).unwrap();
    // error is not checkout-able...
    assert!(mgr.checkout(42, "issue-42", "initial").is_err());
    // ...until reset.
    mgr.reset(42).unwrap();
    assert_eq!(mgr.state_of(42), IssueState::Idle);
    mgr.checkout(42, "issue-42", "initial").unwrap();
}

#[test]
fn reset_preserves_retry_count() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::Error, None).unwrap();
    mgr.reset(42).unwrap();
    assert_eq!(mgr.get(42).unwrap().retry_count, 1);
}

#[test]
fn records_survive_reload() {
    let (_dir, store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.set_pid(42, 12345);

    let reloaded = StatusManager::new(Arc::clone(&store));
    let record = reloaded.get(42).unwrap();
    assert_eq!(record.state, IssueState::Processing);
    assert_eq!(record.pid, Some(12345));
}

#[test]
fn heartbeat_only_touches_processing_records() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(42, "issue-42", "initial").unwrap();
    mgr.checkin(42, IssueState::Completed, None).unwrap();
    let before = mgr.get(42).unwrap().last_heartbeat;
    mgr.update_heartbeat(42);
    assert_eq!(mgr.get(42).unwrap().last_heartbeat, before);
}

#[test]
fn processing_snapshot_lists_only_processing() {
    let (_dir, _store, mgr) = manager();
    mgr.checkout(1, "issue-1", "initial").unwrap();
    mgr.checkout(2, "issue-2", "initial").unwrap();
    mgr.checkin(2, IssueState::Completed, None).unwrap();
    let processing = mgr.processing();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].0, 1);
}

#[test]
fn force_state_emits_no_label_request() {
    let (_dir, store, mgr) = manager();
    mgr.force_state(42, IssueState::Error, Some("orphaned".to_owned()));
    assert_eq!(mgr.state_of(42), IssueState::Error);
    assert!(list_requests(store.paths()).is_empty());
}

#[test]
fn state_serializes_kebab_case() {
    let json = serde_json::to_string(&IssueState::AwaitingResponse).unwrap();
    assert_eq!(json, "\"awaiting-response\"");
}
