// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-issue status records and the checkout/checkin state machine.
//!
//! Transitions are linear with one back-edge:
//!
//! ```text
//! idle → processing → {completed, awaiting-response, error}
//! awaiting-response → processing      (follow-up checkout)
//! error → idle                        (explicit reset)
//! ```
//!
//! Only the process holding the issue's lock may checkout/checkin, so two
//! writers never race on the same record. Label changes are requested via
//! the arbiter, never applied here.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Classify, ErrorKind};
use crate::labels::{
    write_request, LabelMutationRequest, LABEL_AWAITING_RESPONSE, LABEL_COMPLETED,
    LABEL_PROCESSING,
};
use crate::store::{epoch_ms, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueState {
    Idle,
    Pending,
    Processing,
    AwaitingResponse,
    Completed,
    Error,
    Skipped,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::AwaitingResponse => "awaiting-response",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Durable record for one issue, keyed by issue id in `issue-status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: IssueState,
    /// Owning task id while processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl StatusRecord {
    fn idle() -> Self {
        Self {
            state: IssueState::Idle,
            process_id: None,
            pid: None,
            started_at: None,
            last_heartbeat: None,
            ended_at: None,
            task_type: None,
            result: None,
            retry_count: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("issue {issue_id} cannot move from {from} to processing")]
    InvalidTransition { issue_id: u64, from: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for StatusError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Owner of all status records; every mutation is persisted atomically.
pub struct StatusManager {
    store: Arc<StateStore>,
    records: Mutex<BTreeMap<u64, StatusRecord>>,
}

impl StatusManager {
    /// Load existing records from disk (empty on first run).
    pub fn new(store: Arc<StateStore>) -> Self {
        let records = store.load_json_or_default(&store.paths().issue_status());
        Self { store, records: Mutex::new(records) }
    }

    /// Begin processing: only valid from `idle` or `awaiting-response`.
    /// Emits the label request that marks the issue as in progress.
    pub fn checkout(
        &self,
        issue_id: u64,
        task_id: &str,
        task_type: &str,
    ) -> Result<(), StatusError> {
        {
            let mut records = self.records.lock();
            let current = records.get(&issue_id).map(|r| r.state).unwrap_or(IssueState::Idle);
            if !matches!(current, IssueState::Idle | IssueState::AwaitingResponse) {
                return Err(StatusError::InvalidTransition { issue_id, from: current.as_str() });
            }
            let now = epoch_ms();
            records.insert(
                issue_id,
                StatusRecord {
                    state: IssueState::Processing,
                    process_id: Some(task_id.to_owned()),
                    started_at: Some(now),
                    last_heartbeat: Some(now),
                    task_type: Some(task_type.to_owned()),
                    ..StatusRecord::idle()
                },
            );
            self.persist_locked(&records)?;
        }
        self.request_labels(
            issue_id,
            vec![LABEL_PROCESSING.to_owned()],
            vec![LABEL_AWAITING_RESPONSE.to_owned()],
            "checkout",
        );
        info!(issue_id, task_id, "status checkout");
        Ok(())
    }

    /// Finish processing with a terminal-or-waiting state.
    pub fn checkin(
        &self,
        issue_id: u64,
        new_state: IssueState,
        result: Option<String>,
    ) -> Result<(), StatusError> {
        debug_assert!(matches!(
            new_state,
            IssueState::Completed | IssueState::AwaitingResponse | IssueState::Error
        ));
        {
            let mut records = self.records.lock();
            let record = records.entry(issue_id).or_insert_with(StatusRecord::idle);
            record.state = new_state;
            record.ended_at = Some(epoch_ms());
            record.result = result;
            if new_state == IssueState::Error {
                record.retry_count += 1;
            }
            self.persist_locked(&records)?;
        }
        let add = match new_state {
            IssueState::Completed => vec![LABEL_COMPLETED.to_owned()],
            IssueState::AwaitingResponse => vec![LABEL_AWAITING_RESPONSE.to_owned()],
            _ => vec![],
        };
        self.request_labels(issue_id, add, vec![LABEL_PROCESSING.to_owned()], "checkin");
        info!(issue_id, state = new_state.as_str(), "status checkin");
        Ok(())
    }

    /// Record the child pid once the supervisor has spawned it.
    pub fn set_pid(&self, issue_id: u64, pid: u32) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&issue_id) {
            record.pid = Some(pid);
            if let Err(e) = self.persist_locked(&records) {
                warn!(issue_id, err = %e, "failed to persist pid");
            }
        }
    }

    /// Refresh `last_heartbeat`; called for every processing record.
    pub fn update_heartbeat(&self, issue_id: u64) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&issue_id) {
            if record.state == IssueState::Processing {
                record.last_heartbeat = Some(epoch_ms());
                if let Err(e) = self.persist_locked(&records) {
                    warn!(issue_id, err = %e, "failed to persist heartbeat");
                }
            }
        }
    }

    /// Force an issue back to `idle` and drop its transient labels.
    pub fn reset(&self, issue_id: u64) -> Result<(), StatusError> {
        {
            let mut records = self.records.lock();
            let retry_count =
                records.get(&issue_id).map(|r| r.retry_count).unwrap_or(0);
            records.insert(issue_id, StatusRecord { retry_count, ..StatusRecord::idle() });
            self.persist_locked(&records)?;
        }
        self.request_labels(
            issue_id,
            vec![],
            vec![LABEL_PROCESSING.to_owned(), LABEL_AWAITING_RESPONSE.to_owned()],
            "reset",
        );
        info!(issue_id, "status reset to idle");
        Ok(())
    }

    /// Arbiter-only: rewrite the state without emitting a label request.
    /// The arbiter owns labels and reconciles them itself.
    pub fn force_state(&self, issue_id: u64, state: IssueState, result: Option<String>) {
        let mut records = self.records.lock();
        let record = records.entry(issue_id).or_insert_with(StatusRecord::idle);
        record.state = state;
        record.ended_at = Some(epoch_ms());
        if result.is_some() {
            record.result = result;
        }
        if let Err(e) = self.persist_locked(&records) {
            warn!(issue_id, err = %e, "failed to persist forced state");
        }
    }

    pub fn get(&self, issue_id: u64) -> Option<StatusRecord> {
        self.records.lock().get(&issue_id).cloned()
    }

    pub fn state_of(&self, issue_id: u64) -> IssueState {
        self.records.lock().get(&issue_id).map(|r| r.state).unwrap_or(IssueState::Idle)
    }

    /// Snapshot of every record currently in `processing`.
    pub fn processing(&self) -> Vec<(u64, StatusRecord)> {
        self.records
            .lock()
            .iter()
            .filter(|(_, r)| r.state == IssueState::Processing)
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    fn persist_locked(&self, records: &BTreeMap<u64, StatusRecord>) -> Result<(), StoreError> {
        self.store.save_json(&self.store.paths().issue_status(), records)
    }

    fn request_labels(&self, issue_id: u64, add: Vec<String>, remove: Vec<String>, reason: &str) {
        let request =
            LabelMutationRequest::new(issue_id, add, remove, "status-manager", reason);
        if let Err(e) = write_request(self.store.paths(), &request) {
            warn!(issue_id, err = %e, "failed to write label request");
        }
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
