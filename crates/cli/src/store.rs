// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed state store: atomic persistence for everything that must
//! survive a restart, plus the process-level exclusive lock.
//!
//! Writes go through write-tmp / fsync / rename so a crash never leaves a
//! half-written state file. Reads are tolerant: a missing or corrupt file
//! degrades to the empty value with a warning.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Classify, ErrorKind};
use crate::process::{hostname, is_process_alive};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Resolved filesystem layout for one daemon instance.
///
/// ```text
/// <state-root>/
///   processed-issues.json    processed-comments.json
///   running-tasks.json       pending-tasks.json
///   issue-status.json        last-run.json
///   process.lock
///   requests/  requests/failed/  locks/
/// <temp-root>/
///   instruction-<taskId>.json
///   task-<taskId>.{pid,status,output,result}
/// ```
#[derive(Debug, Clone)]
pub struct StorePaths {
    state_root: PathBuf,
    temp_root: PathBuf,
}

impl StorePaths {
    pub fn new(state_root: impl Into<PathBuf>, temp_root: impl Into<PathBuf>) -> Self {
        Self { state_root: state_root.into(), temp_root: temp_root.into() }
    }

    /// Create every directory the daemon writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_root)?;
        std::fs::create_dir_all(self.requests_dir())?;
        std::fs::create_dir_all(self.failed_requests_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        std::fs::create_dir_all(&self.temp_root)?;
        Ok(())
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn processed_issues(&self) -> PathBuf {
        self.state_root.join("processed-issues.json")
    }

    pub fn processed_comments(&self) -> PathBuf {
        self.state_root.join("processed-comments.json")
    }

    pub fn running_tasks(&self) -> PathBuf {
        self.state_root.join("running-tasks.json")
    }

    pub fn pending_tasks(&self) -> PathBuf {
        self.state_root.join("pending-tasks.json")
    }

    pub fn issue_status(&self) -> PathBuf {
        self.state_root.join("issue-status.json")
    }

    pub fn last_run(&self) -> PathBuf {
        self.state_root.join("last-run.json")
    }

    pub fn process_lock(&self) -> PathBuf {
        self.state_root.join("process.lock")
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.state_root.join("requests")
    }

    pub fn failed_requests_dir(&self) -> PathBuf {
        self.requests_dir().join("failed")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_root.join("locks")
    }

    pub fn lock_file(&self, issue_id: u64) -> PathBuf {
        self.locks_dir().join(format!("issue-{issue_id}.lock"))
    }

    pub fn instruction_file(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("instruction-{task_id}.json"))
    }

    pub fn pid_file(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("task-{task_id}.pid"))
    }

    pub fn status_file(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("task-{task_id}.status"))
    }

    pub fn output_file(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("task-{task_id}.output"))
    }

    pub fn result_file(&self, task_id: &str) -> PathBuf {
        self.temp_root.join(format!("task-{task_id}.result"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("process lock held by pid {pid} on {host}")]
    Locked { pid: u32, host: String },
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::Encode(_) => ErrorKind::StoreUnavailable,
            Self::Locked { .. } => ErrorKind::LockHeld,
        }
    }
}

/// Contents of `process.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLockRecord {
    pub pid: u32,
    pub host: String,
    /// Epoch milliseconds.
    pub started_at: u64,
}

/// Per-tick metadata, purely informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastRun {
    pub finished_at: u64,
    pub issues_seen: usize,
    pub tasks_spawned: usize,
    pub tasks_completed: usize,
}

/// Atomic load/save of all persistent structures.
pub struct StateStore {
    paths: StorePaths,
}

impl StateStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Atomic write: serialize, write `<path>.tmp`, fsync, rename.
    ///
    /// A failed write is retried once before surfacing.
    pub fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value)?;
        if let Err(first) = write_atomic(path, &json) {
            warn!(path = %path.display(), err = %first, "state write failed, retrying once");
            write_atomic(path, &json)?;
        }
        Ok(())
    }

    /// Tolerant read: a missing file is the empty value; a corrupt file is
    /// the empty value with a warning.
    pub fn load_json_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> T {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "state read failed, using empty");
                return T::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "state file corrupt, using empty");
                T::default()
            }
        }
    }

    pub fn load_processed_issues(&self) -> BTreeSet<u64> {
        self.load_json_or_default(&self.paths.processed_issues())
    }

    pub fn save_processed_issues(&self, issues: &BTreeSet<u64>) -> Result<(), StoreError> {
        self.save_json(&self.paths.processed_issues(), issues)
    }

    pub fn load_processed_comments(&self) -> BTreeMap<u64, BTreeSet<u64>> {
        self.load_json_or_default(&self.paths.processed_comments())
    }

    pub fn save_processed_comments(
        &self,
        comments: &BTreeMap<u64, BTreeSet<u64>>,
    ) -> Result<(), StoreError> {
        self.save_json(&self.paths.processed_comments(), comments)
    }

    pub fn load_last_run(&self) -> Option<LastRun> {
        self.load_json_or_default::<Option<LastRun>>(&self.paths.last_run())
    }

    pub fn save_last_run(&self, last_run: &LastRun) -> Result<(), StoreError> {
        self.save_json(&self.paths.last_run(), last_run)
    }

    /// Take the process-level exclusive lock.
    ///
    /// An existing lock is stolen when its owner pid is dead on this host,
    /// or when the record is unreadable and older than `corrupt_grace`
    /// (a record mid-write by a starting daemon is briefly unreadable).
    /// A lock from another host is never stolen.
    pub fn acquire_process_lock(&self, corrupt_grace: Duration) -> Result<(), StoreError> {
        let path = self.paths.process_lock();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<ProcessLockRecord>(&contents) {
                Ok(record) => {
                    let ours = hostname();
                    if record.host != ours {
                        return Err(StoreError::Locked { pid: record.pid, host: record.host });
                    }
                    if is_process_alive(record.pid) {
                        return Err(StoreError::Locked { pid: record.pid, host: record.host });
                    }
                    warn!(pid = record.pid, "stealing process lock from dead owner");
                }
                Err(_) => {
                    let fresh = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|mtime| mtime.elapsed().ok())
                        .map(|age| age < corrupt_grace)
                        .unwrap_or(false);
                    if fresh {
                        return Err(StoreError::Locked { pid: 0, host: hostname() });
                    }
                    warn!(path = %path.display(), "stealing corrupt process lock");
                }
            }
        }

        let record = ProcessLockRecord {
            pid: std::process::id(),
            host: hostname(),
            started_at: epoch_ms(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    /// Idempotent: removes the lock file iff this process owns it.
    pub fn release_process_lock(&self) {
        let path = self.paths.process_lock();
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        let owned = serde_json::from_str::<ProcessLockRecord>(&contents)
            .map(|r| r.pid == std::process::id() && r.host == hostname())
            .unwrap_or(false);
        if owned {
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
