// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Label mutation requests: the file protocol between label writers and
//! the arbiter.
//!
//! Forge labels are owned exclusively by the arbiter. Anything that wants
//! a label changed drops a request file into `requests/`; the arbiter
//! applies requests in per-issue mtime order and deletes them. Requests
//! that keep failing are moved to `requests/failed/` for inspection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{epoch_ms, StorePaths};

/// State-bearing label: a task is running for this issue.
pub const LABEL_PROCESSING: &str = "processing";
/// State-bearing label: the task finished and is waiting on a human reply.
pub const LABEL_AWAITING_RESPONSE: &str = "awaiting-response";
/// Terminal label.
pub const LABEL_COMPLETED: &str = "completed";

/// A single requested label change, applied union-then-difference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelMutationRequest {
    pub request_id: String,
    pub issue_id: u64,
    #[serde(default)]
    pub add_labels: Vec<String>,
    #[serde(default)]
    pub remove_labels: Vec<String>,
    pub requested_by: String,
    pub reason: String,
    /// Epoch ms at creation.
    pub timestamp: u64,
}

impl LabelMutationRequest {
    pub fn new(
        issue_id: u64,
        add_labels: Vec<String>,
        remove_labels: Vec<String>,
        requested_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            issue_id,
            add_labels,
            remove_labels,
            requested_by: requested_by.into(),
            reason: reason.into(),
            timestamp: epoch_ms(),
        }
    }

    /// Structurally valid: touches at least one label.
    pub fn is_valid(&self) -> bool {
        !(self.add_labels.is_empty() && self.remove_labels.is_empty())
    }
}

/// Persist a request under `requests/` with a collision-free name.
pub fn write_request(paths: &StorePaths, request: &LabelMutationRequest) -> std::io::Result<()> {
    let dir = paths.requests_dir();
    let mut ts = request.timestamp;
    let mut path = dir.join(format!("label-update-{ts}-{}.json", request.issue_id));
    while path.exists() {
        ts += 1;
        path = dir.join(format!("label-update-{ts}-{}.json", request.issue_id));
    }
    let json = serde_json::to_string_pretty(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)
}

/// A request file on disk, ready for the arbiter.
#[derive(Debug)]
pub struct PendingRequest {
    pub path: PathBuf,
    pub request: LabelMutationRequest,
    /// File mtime in epoch ms; the per-issue apply order.
    pub mtime: u64,
}

/// Read every parseable request file, sorted by mtime then path.
/// Unparseable files are skipped with a warning (the arbiter quarantines
/// them separately).
pub fn list_requests(paths: &StorePaths) -> Vec<PendingRequest> {
    let Ok(entries) = std::fs::read_dir(paths.requests_dir()) else {
        return vec![];
    };
    let mut pending = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        let request = match serde_json::from_str::<LabelMutationRequest>(&contents) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "skipping malformed label request");
                continue;
            }
        };
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(request.timestamp);
        pending.push(PendingRequest { path, request, mtime });
    }
    pending.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));
    pending
}

#[cfg(test)]
#[path = "labels_tests.rs"]
mod tests;
