// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: an in-memory fake forge with scriptable
//! failures, plus state-directory fixtures.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::forge::{Comment, Forge, ForgeError, Issue};
use crate::store::{StateStore, StorePaths};

/// Build a throwaway state root. The `TempDir` must outlive the store.
pub fn temp_store() -> anyhow::Result<(tempfile::TempDir, Arc<StateStore>)> {
    let dir = tempfile::tempdir()?;
    let paths = StorePaths::new(dir.path().join("state"), dir.path().join("temp"));
    paths.ensure()?;
    Ok((dir, Arc::new(StateStore::new(paths))))
}

/// Issue builder with the defaults the dispatcher filters expect.
pub fn open_issue(id: u64, author: &str, labels: &[&str]) -> Issue {
    Issue {
        number: id,
        title: format!("issue {id}"),
        body: "hello".to_owned(),
        labels: labels.iter().map(|l| (*l).to_owned()).collect(),
        author: author.to_owned(),
        state: "open".to_owned(),
    }
}

/// A failure to script into the fake forge.
#[derive(Debug, Clone, Copy)]
pub enum FailWith {
    RateLimited { reset_at: Option<u64> },
    Network,
    Auth,
    NotFound,
}

impl FailWith {
    fn to_error(self) -> ForgeError {
        match self {
            Self::RateLimited { reset_at } => ForgeError::RateLimited { reset_at },
            Self::Network => ForgeError::Network("connection reset".to_owned()),
            Self::Auth => ForgeError::Auth,
            Self::NotFound => ForgeError::NotFound("scripted".to_owned()),
        }
    }
}

#[derive(Default)]
struct FakeForgeState {
    issues: BTreeMap<u64, Issue>,
    comments: BTreeMap<u64, Vec<Comment>>,
    /// Comments posted by the system under test, in order.
    posted: Vec<(u64, String)>,
    /// Scripted failures per operation name, consumed front-first.
    failures: BTreeMap<&'static str, Vec<FailWith>>,
    next_comment_id: u64,
}

/// In-memory forge. Labels behave like the real thing: adds are unions,
/// removes are set differences, and removing an absent label succeeds.
#[derive(Default)]
pub struct FakeForge {
    state: Mutex<FakeForgeState>,
}

impl FakeForge {
    pub fn new() -> Self {
        Self { state: Mutex::new(FakeForgeState { next_comment_id: 1000, ..Default::default() }) }
    }

    pub fn put_issue(&self, issue: Issue) {
        self.state.lock().issues.insert(issue.number, issue);
    }

    pub fn remove_issue(&self, id: u64) {
        self.state.lock().issues.remove(&id);
    }

    pub fn labels_of(&self, id: u64) -> Vec<String> {
        self.state
            .lock()
            .issues
            .get(&id)
            .map(|i| i.labels.clone())
            .unwrap_or_default()
    }

    /// Add a user comment (e.g. a follow-up); returns its id.
    pub fn user_comment(&self, id: u64, author: &str, body: &str) -> u64 {
        let mut state = self.state.lock();
        state.next_comment_id += 1;
        let cid = state.next_comment_id;
        state.comments.entry(id).or_default().push(Comment {
            id: cid,
            author: author.to_owned(),
            body: body.to_owned(),
        });
        cid
    }

    /// Comments posted through [`Forge::add_comment`], in order.
    pub fn posted_comments(&self) -> Vec<(u64, String)> {
        self.state.lock().posted.clone()
    }

    /// Script the next call to `op` to fail. Ops: `list_issues`,
    /// `get_issue`, `list_comments`, `add_comment`, `add_labels`,
    /// `remove_labels`.
    pub fn fail_next(&self, op: &'static str, failure: FailWith) {
        self.state.lock().failures.entry(op).or_default().push(failure);
    }

    fn take_failure(&self, op: &'static str) -> Option<ForgeError> {
        let mut state = self.state.lock();
        let queue = state.failures.get_mut(op)?;
        if queue.is_empty() {
            return None;
        }
        Some(queue.remove(0).to_error())
    }
}

#[async_trait]
impl Forge for FakeForge {
    async fn list_issues(&self, state: &str, labels: &[String]) -> Result<Vec<Issue>, ForgeError> {
        if let Some(err) = self.take_failure("list_issues") {
            return Err(err);
        }
        let issues = self.state.lock().issues.clone();
        Ok(issues
            .into_values()
            .filter(|i| i.state == state)
            .filter(|i| labels.is_empty() || labels.iter().any(|l| i.has_label(l)))
            .collect())
    }

    async fn get_issue(&self, id: u64) -> Result<Issue, ForgeError> {
        if let Some(err) = self.take_failure("get_issue") {
            return Err(err);
        }
        self.state
            .lock()
            .issues
            .get(&id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("issue {id}")))
    }

    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ForgeError> {
        if let Some(err) = self.take_failure("list_comments") {
            return Err(err);
        }
        Ok(self.state.lock().comments.get(&id).cloned().unwrap_or_default())
    }

    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ForgeError> {
        if let Some(err) = self.take_failure("add_comment") {
            return Err(err);
        }
        let mut state = self.state.lock();
        if !state.issues.contains_key(&id) {
            return Err(ForgeError::NotFound(format!("issue {id}")));
        }
        state.posted.push((id, body.to_owned()));
        Ok(())
    }

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError> {
        if let Some(err) = self.take_failure("add_labels") {
            return Err(err);
        }
        let mut state = self.state.lock();
        let Some(issue) = state.issues.get_mut(&id) else {
            return Err(ForgeError::NotFound(format!("issue {id}")));
        };
        for label in labels {
            if !issue.labels.iter().any(|l| l == label) {
                issue.labels.push(label.clone());
            }
        }
        Ok(())
    }

    async fn remove_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError> {
        if let Some(err) = self.take_failure("remove_labels") {
            return Err(err);
        }
        let mut state = self.state.lock();
        let Some(issue) = state.issues.get_mut(&id) else {
            return Err(ForgeError::NotFound(format!("issue {id}")));
        };
        issue.labels.retain(|l| !labels.iter().any(|r| r == l));
        Ok(())
    }
}
