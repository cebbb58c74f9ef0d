// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess supervisor: spawns, tracks, and reaps detached workers.
//!
//! Each task runs as this binary re-spawned in worker mode, in its own
//! process group with stdio redirected to the `.output` artifact. The
//! parent never waits on a worker: completion is signalled by the worker
//! atomically writing the `.result` artifact. The in-flight table is
//! persisted on every change, so a restarted parent reclaims live
//! children and settles dead ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Classify, ErrorKind};
use crate::lock::{LockError, LockService};
use crate::process::{is_process_alive, terminate};
use crate::store::{epoch_ms, StateStore, StoreError};
use crate::task::Task;
use crate::worker::{TaskResult, WorkerInstruction};

/// One running (or recoverable) child, keyed by task id in
/// `running-tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightEntry {
    pub issue_id: u64,
    pub pid: u32,
    /// Epoch ms.
    pub started_at: u64,
    pub task_type: String,
    pub instruction_path: PathBuf,
    pub pid_path: PathBuf,
    pub status_path: PathBuf,
    pub output_path: PathBuf,
    pub result_path: PathBuf,
    #[serde(default)]
    pub killed: bool,
}

pub type InflightTable = BTreeMap<String, InflightEntry>;

/// A settled task, surfaced to the dispatcher through the completion
/// path whether the child succeeded, failed, or vanished.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: String,
    pub issue_id: u64,
    pub task_type: String,
    pub result: TaskResult,
}

#[derive(Debug, Clone)]
pub struct SpawnedTask {
    pub task_id: String,
    pub pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for SupervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn(_) => ErrorKind::SubprocessCrash,
            Self::Lock(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Io(_) => ErrorKind::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Set when the caller already holds the issue lock.
    pub skip_lock_acquisition: bool,
}

pub struct Supervisor {
    store: Arc<StateStore>,
    locks: Arc<LockService>,
    inflight: InflightTable,
    /// Child handles for workers spawned by this process, kept only so
    /// exited workers get reaped. Recovered children have no handle.
    children: HashMap<String, std::process::Child>,
    worker_exe: PathBuf,
    agent_command: Vec<String>,
    max_duration: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<StateStore>,
        locks: Arc<LockService>,
        worker_exe: PathBuf,
        agent_command: Vec<String>,
    ) -> Self {
        Self {
            store,
            locks,
            inflight: InflightTable::new(),
            children: HashMap::new(),
            worker_exe,
            agent_command,
            max_duration: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn running_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn running_task_ids(&self) -> BTreeSet<String> {
        self.inflight.keys().cloned().collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inflight.contains_key(task_id)
    }

    pub fn inflight(&self) -> &InflightTable {
        &self.inflight
    }

    /// Spawn a detached worker for `task` and return immediately.
    ///
    /// On spawn failure the lock is released and the error surfaces for
    /// the retry policy; no in-flight entry is left behind.
    pub fn execute(
        &mut self,
        task: &Task,
        prompt: String,
        opts: ExecuteOptions,
    ) -> Result<SpawnedTask, SupervisorError> {
        let task_id = task.task_id.clone();
        let issue_id = task.issue_id();

        if !opts.skip_lock_acquisition {
            self.locks.acquire(issue_id, &task_id)?;
        }

        match self.spawn_locked(task, prompt) {
            Ok(spawned) => Ok(spawned),
            Err(e) => {
                self.locks.release(issue_id, &task_id);
                Err(e)
            }
        }
    }

    fn spawn_locked(&mut self, task: &Task, prompt: String) -> Result<SpawnedTask, SupervisorError> {
        let paths = self.store.paths();
        let task_id = task.task_id.clone();

        let instruction = WorkerInstruction {
            task_id: task_id.clone(),
            issue_id: task.issue_id(),
            prompt,
            agent_command: self.agent_command.clone(),
            result_path: paths.result_file(&task_id),
            status_path: paths.status_file(&task_id),
        };
        let instruction_path = paths.instruction_file(&task_id);
        self.store.save_json(&instruction_path, &instruction)?;

        let output_path = paths.output_file(&task_id);
        let output = std::fs::File::create(&output_path)?;
        let output_err = output.try_clone()?;

        let mut command = std::process::Command::new(&self.worker_exe);
        command
            .arg("worker")
            .arg("--instruction")
            .arg(&instruction_path)
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(output_err)
            // New process group: the worker survives the parent's death and
            // never receives the terminal's signals.
            .process_group(0);

        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();

        let pid_path = paths.pid_file(&task_id);
        std::fs::write(&pid_path, pid.to_string())?;

        let entry = InflightEntry {
            issue_id: task.issue_id(),
            pid,
            started_at: epoch_ms(),
            task_type: task.item.kind.as_str().to_owned(),
            instruction_path,
            pid_path,
            status_path: instruction.status_path.clone(),
            output_path,
            result_path: instruction.result_path.clone(),
            killed: false,
        };
        self.children.insert(task_id.clone(), child);
        self.inflight.insert(task_id.clone(), entry);
        self.persist();

        info!(task_id = %task_id, pid, "spawned worker");
        Ok(SpawnedTask { task_id, pid })
    }

    /// Collect every settled task: result artifact present, child dead
    /// without a result, or child past the per-task timeout.
    ///
    /// When both "result exists" and "pid dead" hold, the existing file
    /// wins — a worker may exit between writing the result and our scan.
    pub fn poll_completed(&mut self) -> Vec<Completion> {
        // Reap any of our own workers that have exited.
        for child in self.children.values_mut() {
            let _ = child.try_wait();
        }

        let task_ids: Vec<String> = self.inflight.keys().cloned().collect();
        let mut completions = Vec::new();

        for task_id in task_ids {
            let Some(entry) = self.inflight.get(&task_id) else {
                continue;
            };
            if entry.killed {
                continue;
            }
            let entry = entry.clone();

            if entry.result_path.exists() {
                let result = self.load_result(&task_id, &entry);
                self.settle(&task_id, &entry, result.success);
                completions.push(Completion {
                    task_id: task_id.clone(),
                    issue_id: entry.issue_id,
                    task_type: entry.task_type.clone(),
                    result,
                });
                continue;
            }

            let age = Duration::from_millis(epoch_ms().saturating_sub(entry.started_at));
            if age > self.max_duration && is_process_alive(entry.pid) {
                warn!(task_id = %task_id, pid = entry.pid, "worker exceeded max duration, terminating");
                terminate(entry.pid);
                let result = TaskResult::interrupted(&task_id);
                self.settle(&task_id, &entry, false);
                completions.push(Completion {
                    task_id: task_id.clone(),
                    issue_id: entry.issue_id,
                    task_type: entry.task_type.clone(),
                    result,
                });
                continue;
            }

            if !is_process_alive(entry.pid) {
                warn!(task_id = %task_id, pid = entry.pid, "worker died without a result");
                let result = TaskResult::interrupted(&task_id);
                self.settle(&task_id, &entry, false);
                completions.push(Completion {
                    task_id: task_id.clone(),
                    issue_id: entry.issue_id,
                    task_type: entry.task_type.clone(),
                    result,
                });
            }
        }

        if !completions.is_empty() {
            self.persist();
        }
        completions
    }

    /// Reload the in-flight table after a restart. Live children are
    /// reclaimed as-is; dead ones settle through [`Self::poll_completed`]
    /// on the same call.
    pub fn recover(&mut self) -> Vec<Completion> {
        self.inflight = self.store.load_json_or_default(&self.store.paths().running_tasks());
        if self.inflight.is_empty() {
            return Vec::new();
        }
        let live = self.inflight.values().filter(|e| is_process_alive(e.pid)).count();
        info!(total = self.inflight.len(), live, "recovered in-flight table");
        self.poll_completed()
    }

    /// Terminate every recorded child. Entries stay in the table marked
    /// `killed` and their artifacts are retained for forensics.
    pub fn kill_all(&mut self) {
        for (task_id, entry) in self.inflight.iter_mut() {
            if terminate(entry.pid) {
                info!(task_id = %task_id, pid = entry.pid, "terminated worker");
            }
            entry.killed = true;
        }
        self.persist();
    }

    fn load_result(&self, task_id: &str, entry: &InflightEntry) -> TaskResult {
        let contents = match std::fs::read_to_string(&entry.result_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(task_id, err = %e, "unreadable result artifact");
                return TaskResult::interrupted(task_id);
            }
        };
        match serde_json::from_str::<TaskResult>(&contents) {
            Ok(mut result) => {
                if result.task_id != task_id {
                    warn!(task_id, artifact_task_id = %result.task_id,
                        "result artifact names a different task");
                    result.task_id = task_id.to_owned();
                }
                result
            }
            Err(e) => {
                warn!(task_id, err = %e, "malformed result artifact");
                let mut result = TaskResult::interrupted(task_id);
                result.error = format!("malformed result artifact: {e}");
                result
            }
        }
    }

    /// Remove the entry, clean artifacts, release the lock. The `.output`
    /// capture is kept on failure so error comments can point at it.
    fn settle(&mut self, task_id: &str, entry: &InflightEntry, success: bool) {
        let _ = std::fs::remove_file(&entry.instruction_path);
        let _ = std::fs::remove_file(&entry.pid_path);
        let _ = std::fs::remove_file(&entry.status_path);
        let _ = std::fs::remove_file(&entry.result_path);
        if success {
            let _ = std::fs::remove_file(&entry.output_path);
        }
        self.children.remove(task_id);
        self.inflight.remove(task_id);
        self.locks.release(entry.issue_id, task_id);
    }

    fn persist(&self) {
        if let Err(e) = self.store.save_json(&self.store.paths().running_tasks(), &self.inflight) {
            warn!(err = %e, "failed to persist in-flight table");
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
