// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded priority task queue with duplicate suppression and gated,
//! non-destructive dequeue.
//!
//! Ordering is `(priority desc, enqueued_at asc)`. Dequeue only inspects
//! the head: if any gate (concurrency, rate limit, lock) blocks it, the
//! head stays put and the dispatcher retries next tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Classify, ErrorKind};
use crate::store::StateStore;
use crate::task::Task;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("duplicate task {task_id}")]
    Duplicate { task_id: String },
}

impl Classify for QueueError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Snapshot of the other two duplicate-suppression sources: what the
/// supervisor is running and what the status manager marks `processing`.
#[derive(Debug, Default, Clone)]
pub struct ExternalDedup {
    pub running_task_ids: BTreeSet<String>,
    pub processing_issues: BTreeSet<u64>,
}

/// Gates consulted by [`TaskQueue::dequeue`].
pub struct DequeueGates<'a> {
    pub running: usize,
    pub max_concurrent: usize,
    pub limited: bool,
    pub lock_acquirable: &'a dyn Fn(u64) -> bool,
}

pub struct TaskQueue {
    store: Arc<StateStore>,
    /// Sorted: highest priority first, FIFO within a priority.
    tasks: Vec<Task>,
    capacity: usize,
    debounce: Duration,
    dirty: bool,
    last_snapshot: Option<Instant>,
}

impl TaskQueue {
    pub fn new(store: Arc<StateStore>, capacity: usize) -> Self {
        Self {
            store,
            tasks: Vec::new(),
            capacity,
            debounce: Duration::from_secs(1),
            dirty: false,
            last_snapshot: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t.task_id == task_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Insert a task, rejecting duplicates (against queue contents and the
    /// external sources) and overflow.
    pub fn enqueue(&mut self, task: Task, external: &ExternalDedup) -> Result<(), QueueError> {
        if self.contains(&task.task_id)
            || external.running_task_ids.contains(&task.task_id)
            || external.processing_issues.contains(&task.issue_id())
        {
            return Err(QueueError::Duplicate { task_id: task.task_id });
        }
        if self.tasks.len() >= self.capacity {
            warn!(task_id = %task.task_id, capacity = self.capacity, "queue full");
            return Err(QueueError::Full { capacity: self.capacity });
        }

        let pos = self
            .tasks
            .iter()
            .position(|t| {
                (t.priority, std::cmp::Reverse(t.enqueued_at))
                    < (task.priority, std::cmp::Reverse(task.enqueued_at))
            })
            .unwrap_or(self.tasks.len());
        debug!(task_id = %task.task_id, priority = task.priority, pos, "enqueued");
        self.tasks.insert(pos, task);
        self.dirty = true;
        Ok(())
    }

    /// Remove and return the head iff every gate clears; otherwise `None`
    /// and the queue is untouched.
    pub fn dequeue(&mut self, gates: &DequeueGates<'_>) -> Option<Task> {
        if gates.running >= gates.max_concurrent || gates.limited {
            return None;
        }
        let head = self.tasks.first()?;
        if !(gates.lock_acquirable)(head.issue_id()) {
            debug!(task_id = %head.task_id, "head blocked on lock, holding");
            return None;
        }
        let task = self.tasks.remove(0);
        self.dirty = true;
        Some(task)
    }

    /// Drop a queued task by id (used when revalidation fails).
    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.task_id == task_id)?;
        self.dirty = true;
        Some(self.tasks.remove(pos))
    }

    /// Persist the queue if it changed and the debounce window elapsed.
    pub fn persist_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(last) = self.last_snapshot {
            if last.elapsed() < self.debounce {
                return;
            }
        }
        self.flush();
    }

    /// Persist unconditionally (shutdown path).
    pub fn flush(&mut self) {
        if let Err(e) = self.store.save_json(&self.store.paths().pending_tasks(), &self.tasks) {
            warn!(err = %e, "queue snapshot failed");
            return;
        }
        self.dirty = false;
        self.last_snapshot = Some(Instant::now());
    }

    /// Read the snapshot left by a previous run. The dispatcher
    /// revalidates each task against the forge before re-enqueueing.
    pub fn load_snapshot(store: &StateStore) -> Vec<Task> {
        let tasks: Vec<Task> = store.load_json_or_default(&store.paths().pending_tasks());
        if !tasks.is_empty() {
            info!(count = tasks.len(), "restored queue snapshot");
        }
        tasks
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
