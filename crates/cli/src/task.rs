// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Work items and tasks: the units the dispatcher schedules.
//!
//! A [`WorkItem`] is a forge issue or a follow-up comment on one. A
//! [`Task`] wraps an item with scheduling metadata and a deterministic id
//! that doubles as the lock key, the artifact prefix, and the queue dedup
//! key.

use serde::{Deserialize, Serialize};

/// Default priority for tasks created from a fresh issue.
pub const PRIORITY_INITIAL: i32 = 50;
/// Follow-up comments jump the queue ahead of fresh issues.
pub const PRIORITY_FOLLOW_UP: i32 = 60;

/// Whether an item is a fresh issue or a follow-up comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Initial,
    FollowUp,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::FollowUp => "follow-up",
        }
    }
}

/// A forge issue (or follow-up comment) eligible to drive a task.
///
/// Immutable once enqueued; the dispatcher re-fetches the issue before
/// execution rather than trusting this snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Forge issue number.
    pub id: u64,
    /// Set for follow-ups; `None` for the initial issue body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<u64>,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub kind: ItemKind,
}

impl WorkItem {
    /// Deterministic task id: `issue-<id>` or `issue-<id>-comment-<cid>`.
    pub fn task_id(&self) -> String {
        match self.comment_id {
            Some(cid) => format!("issue-{}-comment-{cid}", self.id),
            None => format!("issue-{}", self.id),
        }
    }
}

/// Unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Higher runs first.
    pub priority: i32,
    pub attempts: u32,
    /// Epoch milliseconds at enqueue time; ties in priority break FIFO.
    pub enqueued_at: u64,
    pub item: WorkItem,
    /// Labels observed at enqueue time, revalidated on restore.
    pub labels: Vec<String>,
}

impl Task {
    pub fn new(item: WorkItem, priority: i32, enqueued_at: u64) -> Self {
        let labels = item.labels.clone();
        Self { task_id: item.task_id(), priority, attempts: 0, enqueued_at, item, labels }
    }

    pub fn issue_id(&self) -> u64 {
        self.item.id
    }
}

/// Case-insensitive substring scan for any of the configured completion
/// keywords. Used to decide `completed` vs `awaiting-response` from both
/// the child's output and the originating request body.
pub fn contains_completion_keyword(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let haystack = text.to_lowercase();
    keywords.iter().any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
