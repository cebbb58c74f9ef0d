// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::store::StorePaths;

fn paths() -> (tempfile::TempDir, StorePaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::new(dir.path().join("state"), dir.path().join("temp"));
    paths.ensure().unwrap();
    (dir, paths)
}

fn request(issue_id: u64) -> LabelMutationRequest {
    LabelMutationRequest::new(
        issue_id,
        vec![LABEL_PROCESSING.to_owned()],
        vec![LABEL_AWAITING_RESPONSE.to_owned()],
        "status-manager",
        "checkout",
    )
}

#[test]
fn write_then_list_round_trips() {
    let (_dir, paths) = paths();
    let req = request(42);
    write_request(&paths, &req).unwrap();

    let pending = list_requests(&paths);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.issue_id, 42);
    assert_eq!(pending[0].request.request_id, req.request_id);
    assert_eq!(pending[0].request.add_labels, vec![LABEL_PROCESSING]);
}

#[test]
fn filename_follows_layout() {
    let (_dir, paths) = paths();
    let req = request(42);
    write_request(&paths, &req).unwrap();
    let pending = list_requests(&paths);
    let name = pending[0].path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("label-update-"), "unexpected name: {name}");
    assert!(name.ends_with("-42.json"), "unexpected name: {name}");
}

#[test]
fn same_millisecond_requests_get_distinct_files() {
    let (_dir, paths) = paths();
    let mut a = request(42);
    let mut b = request(42);
    a.timestamp = 1000;
    b.timestamp = 1000;
    write_request(&paths, &a).unwrap();
    write_request(&paths, &b).unwrap();
    assert_eq!(list_requests(&paths).len(), 2);
}

#[test]
fn malformed_files_are_skipped() {
    let (_dir, paths) = paths();
    std::fs::write(paths.requests_dir().join("label-update-1-1.json"), "nope").unwrap();
    write_request(&paths, &request(2)).unwrap();
    let pending = list_requests(&paths);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.issue_id, 2);
}

#[test]
fn failed_subdirectory_is_not_listed() {
    let (_dir, paths) = paths();
    let req = request(3);
    let json = serde_json::to_string(&req).unwrap();
    std::fs::write(paths.failed_requests_dir().join("label-update-1-3.json"), json).unwrap();
    assert!(list_requests(&paths).is_empty());
}

#[test]
fn empty_mutation_is_invalid() {
    let req = LabelMutationRequest::new(1, vec![], vec![], "x", "y");
    assert!(!req.is_valid());
    assert!(request(1).is_valid());
}
