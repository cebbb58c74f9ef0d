// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exclusive advisory locks on work items.
//!
//! One lock file per issue under `locks/`. The owner is `{pid, host,
//! task_id}`; validity requires a fresh heartbeat and, when the host
//! matches ours, a live owner pid. Locks from other hosts are never
//! stolen — only their owning host can recover them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Classify, ErrorKind};
use crate::process::{hostname, is_process_alive};
use crate::store::{epoch_ms, StorePaths};

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub task_id: String,
}

/// Contents of `locks/issue-<id>.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked_by: LockOwner,
    /// Epoch ms.
    pub acquired_at: u64,
    pub ttl_ms: u64,
    /// Epoch ms of the last owner heartbeat.
    pub heartbeat: u64,
}

impl LockRecord {
    /// A record is valid while its heartbeat is fresh and, for locks held
    /// on this host, the owning pid is still alive.
    fn is_valid(&self, now: u64) -> bool {
        if self.locked_by.host != hostname() {
            return true;
        }
        let fresh = now.saturating_sub(self.heartbeat) < self.ttl_ms;
        fresh && is_process_alive(self.locked_by.pid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("issue {issue_id} is locked by {holder}")]
    Held { issue_id: u64, holder: String },
    #[error("lock I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock record malformed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Classify for LockError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Held { .. } => ErrorKind::LockHeld,
            Self::Io(_) | Self::Encode(_) => ErrorKind::StoreUnavailable,
        }
    }
}

/// Advisory lock manager for one daemon instance.
pub struct LockService {
    paths: StorePaths,
    ttl: Duration,
}

impl LockService {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths, ttl: Duration::from_secs(5 * 60) }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Acquire the lock for `issue_id` on behalf of `task_id`.
    ///
    /// An invalid existing lock (dead same-host owner or expired
    /// heartbeat) is stolen with a log line.
    pub fn acquire(&self, issue_id: u64, task_id: &str) -> Result<(), LockError> {
        let path = self.paths.lock_file(issue_id);
        let now = epoch_ms();

        if let Some(existing) = self.read_record(&path) {
            if existing.locked_by.pid == std::process::id()
                && existing.locked_by.host == hostname()
                && existing.locked_by.task_id == task_id
            {
                // Already ours for this task: refresh instead of failing.
                return self.write_record(&path, task_id, existing.acquired_at, now);
            }
            if existing.is_valid(now) {
                return Err(LockError::Held {
                    issue_id,
                    holder: existing.locked_by.task_id,
                });
            }
            info!(issue_id, task_id, prior = %existing.locked_by.task_id,
                "stealing expired lock");
        }

        self.write_record(&path, task_id, now, now)
    }

    /// Whether the lock could be acquired right now, without taking it.
    pub fn acquirable(&self, issue_id: u64) -> bool {
        let path = self.paths.lock_file(issue_id);
        match self.read_record(&path) {
            None => true,
            Some(record) => !record.is_valid(epoch_ms()),
        }
    }

    /// Refresh the heartbeat. Fails silently if the lock has moved on —
    /// the sweeper already reclaimed it and the new holder owns it now.
    pub fn heartbeat(&self, issue_id: u64, task_id: &str) {
        let path = self.paths.lock_file(issue_id);
        let Some(record) = self.read_record(&path) else {
            return;
        };
        if record.locked_by.task_id != task_id || record.locked_by.host != hostname() {
            debug!(issue_id, task_id, "skipping heartbeat for lock we no longer hold");
            return;
        }
        if let Err(e) = self.write_record(&path, task_id, record.acquired_at, epoch_ms()) {
            warn!(issue_id, err = %e, "lock heartbeat write failed");
        }
    }

    /// Delete the lock iff `task_id` holds it. Idempotent.
    pub fn release(&self, issue_id: u64, task_id: &str) {
        let path = self.paths.lock_file(issue_id);
        let Some(record) = self.read_record(&path) else {
            return;
        };
        if record.locked_by.task_id == task_id && record.locked_by.host == hostname() {
            let _ = std::fs::remove_file(&path);
        }
    }

    /// Remove every expired lock owned by this host. Returns the count.
    pub fn sweep_stale(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(self.paths.locks_dir()) else {
            return 0;
        };
        let now = epoch_ms();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(record) = self.read_record(&path) else {
                continue;
            };
            if record.locked_by.host != hostname() {
                continue;
            }
            if !record.is_valid(now) {
                info!(holder = %record.locked_by.task_id, path = %path.display(),
                    "sweeping expired lock");
                let _ = std::fs::remove_file(&path);
                removed += 1;
            }
        }
        removed
    }

    /// Background sweeper loop, cancelled via `shutdown`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = self.sweep_stale();
                if removed > 0 {
                    info!(removed, "lock sweep reclaimed stale locks");
                }
            }
        });
    }

    fn read_record(&self, path: &Path) -> Option<LockRecord> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "unreadable lock record");
                None
            }
        }
    }

    fn write_record(
        &self,
        path: &Path,
        task_id: &str,
        acquired_at: u64,
        heartbeat: u64,
    ) -> Result<(), LockError> {
        let record = LockRecord {
            locked_by: LockOwner {
                pid: std::process::id(),
                host: hostname(),
                task_id: task_id.to_owned(),
            },
            acquired_at,
            ttl_ms: self.ttl.as_millis() as u64,
            heartbeat,
        };
        let json = serde_json::to_string_pretty(&record)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
