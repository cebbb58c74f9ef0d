// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Label arbiter: the only writer of forge labels.
//!
//! Every other component requests label changes by dropping files into
//! `requests/`; the arbiter applies them against the forge's current
//! labels (union-then-difference) in per-issue mtime order, deleting each
//! file after a successful apply. Requests that keep failing move to
//! `requests/failed/` for a human.
//!
//! The arbiter also runs the orphan sweep: a `processing` status whose
//! heartbeat went stale and whose pid is gone is reset to `error`, its
//! `processing` label removed and its lock released. This is the only
//! path that recovers label state after a hard subprocess crash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forge::{Forge, ForgeError};
use crate::labels::{list_requests, LabelMutationRequest, PendingRequest, LABEL_PROCESSING};
use crate::lock::LockService;
use crate::process::is_process_alive;
use crate::status::{IssueState, StatusManager};
use crate::store::{epoch_ms, StateStore};
use crate::supervisor::InflightTable;

pub struct Arbiter {
    forge: Arc<dyn Forge>,
    store: Arc<StateStore>,
    status: Arc<StatusManager>,
    locks: Arc<LockService>,
    poll_interval: Duration,
    sweep_interval: Duration,
    heartbeat_timeout: Duration,
    max_attempts: u32,
    /// Failure counts per request id; requests live on disk, counters
    /// don't need to.
    attempts: HashMap<String, u32>,
}

impl Arbiter {
    pub fn new(
        forge: Arc<dyn Forge>,
        store: Arc<StateStore>,
        status: Arc<StatusManager>,
        locks: Arc<LockService>,
    ) -> Self {
        Self {
            forge,
            store,
            status,
            locks,
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30 * 60),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            max_attempts: 3,
            attempts: HashMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Reconciler loop; runs until `shutdown` cancels.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("label arbiter started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.process_requests().await;
                }
                _ = sweep.tick() => {
                    self.sweep_orphans().await;
                }
            }
        }
        info!("label arbiter stopped");
    }

    /// Apply every pending request file once. Returns how many applied.
    ///
    /// The listing is globally mtime-sorted and applied sequentially, so
    /// requests for the same issue land in order.
    pub async fn process_requests(&mut self) -> usize {
        let pending = list_requests(self.store.paths());
        let mut applied = 0;
        for entry in pending {
            if self.handle_request(&entry).await {
                applied += 1;
            }
        }
        applied
    }

    async fn handle_request(&mut self, entry: &PendingRequest) -> bool {
        let request = &entry.request;

        if !request.is_valid() {
            warn!(request_id = %request.request_id, "label request touches no labels");
            self.quarantine(entry);
            return false;
        }

        match self.apply(request).await {
            Ok(()) => {
                let _ = std::fs::remove_file(&entry.path);
                self.attempts.remove(&request.request_id);
                debug!(request_id = %request.request_id, issue_id = request.issue_id,
                    "label request applied");
                true
            }
            Err(ForgeError::NotFound(_)) => {
                warn!(request_id = %request.request_id, issue_id = request.issue_id,
                    "label request references a missing issue");
                self.quarantine(entry);
                false
            }
            Err(e) => {
                let count = self.attempts.entry(request.request_id.clone()).or_insert(0);
                *count += 1;
                warn!(request_id = %request.request_id, issue_id = request.issue_id,
                    attempt = *count, err = %e, "label request failed");
                if *count >= self.max_attempts {
                    self.quarantine(entry);
                    self.attempts.remove(&request.request_id);
                }
                false
            }
        }
    }

    /// Union-then-difference against the issue's current labels: only
    /// labels actually missing are added, only labels actually present
    /// are removed.
    async fn apply(&self, request: &LabelMutationRequest) -> Result<(), ForgeError> {
        let issue = self.forge.get_issue(request.issue_id).await?;

        let to_add: Vec<String> = request
            .add_labels
            .iter()
            .filter(|l| !issue.has_label(l))
            .cloned()
            .collect();
        let to_remove: Vec<String> = request
            .remove_labels
            .iter()
            .filter(|l| issue.has_label(l))
            .cloned()
            .collect();

        if !to_add.is_empty() {
            self.forge.add_labels(request.issue_id, &to_add).await?;
        }
        if !to_remove.is_empty() {
            self.forge.remove_labels(request.issue_id, &to_remove).await?;
        }
        Ok(())
    }

    fn quarantine(&self, entry: &PendingRequest) {
        let Some(name) = entry.path.file_name() else {
            return;
        };
        let dest = self.store.paths().failed_requests_dir().join(name);
        if let Err(e) = std::fs::rename(&entry.path, &dest) {
            warn!(path = %entry.path.display(), err = %e, "failed to quarantine request");
        }
    }

    /// Recover orphans: `processing` records with a stale heartbeat and a
    /// dead (or unknown) pid. Returns how many were recovered.
    pub async fn sweep_orphans(&self) -> usize {
        let inflight: InflightTable =
            self.store.load_json_or_default(&self.store.paths().running_tasks());
        let now = epoch_ms();
        let timeout_ms = self.heartbeat_timeout.as_millis() as u64;
        let mut recovered = 0;

        for (issue_id, record) in self.status.processing() {
            let heartbeat = record.last_heartbeat.unwrap_or(0);
            if now.saturating_sub(heartbeat) <= timeout_ms {
                continue;
            }
            let task_id = record.process_id.clone().unwrap_or_else(|| format!("issue-{issue_id}"));
            let pid = record.pid.or_else(|| inflight.get(&task_id).map(|e| e.pid));
            if pid.map(is_process_alive).unwrap_or(false) {
                continue;
            }

            warn!(issue_id, task_id = %task_id, "orphaned task detected, recovering");
            self.status.force_state(
                issue_id,
                IssueState::Error,
                Some("orphaned: heartbeat lost and process gone".to_owned()),
            );
            if let Err(e) =
                self.forge.remove_labels(issue_id, &[LABEL_PROCESSING.to_owned()]).await
            {
                warn!(issue_id, err = %e, "failed to remove processing label from orphan");
            }
            self.locks.release(issue_id, &task_id);
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "orphan sweep recovered tasks");
        }
        recovered
    }
}

#[cfg(test)]
#[path = "arbiter_tests.rs"]
mod tests;
