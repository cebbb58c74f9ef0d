// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The polling loop: one cooperative dispatcher driving poll → filter →
//! enqueue → drain → completions each tick.
//!
//! The dispatcher is the only layer that decides user-visible actions
//! (comments, status transitions). Child failures arrive through the
//! completion path as failed results, never as errors, so success and
//! failure flow through the same code.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHandle, Settings};
use crate::error::{Classify, ErrorKind};
use crate::forge::{Forge, Issue};
use crate::labels::{LABEL_AWAITING_RESPONSE, LABEL_COMPLETED, LABEL_PROCESSING};
use crate::limiter::{Channel, RateLimiter};
use crate::lock::LockService;
use crate::queue::{DequeueGates, ExternalDedup, QueueError, TaskQueue};
use crate::retry::RetryPolicy;
use crate::status::{IssueState, StatusManager};
use crate::store::{epoch_ms, LastRun, StateStore};
use crate::supervisor::{Completion, ExecuteOptions, Supervisor};
use crate::task::{
    contains_completion_keyword, ItemKind, Task, WorkItem, PRIORITY_FOLLOW_UP, PRIORITY_INITIAL,
};

/// Everything the dispatcher needs, wired at startup.
pub struct DispatcherDeps {
    pub config: ConfigHandle,
    pub forge: Arc<dyn Forge>,
    pub store: Arc<StateStore>,
    pub limiter: Arc<RateLimiter>,
    pub locks: Arc<LockService>,
    pub status: Arc<StatusManager>,
    pub queue: TaskQueue,
    pub supervisor: Supervisor,
}

pub struct Dispatcher {
    config: ConfigHandle,
    forge: Arc<dyn Forge>,
    store: Arc<StateStore>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    locks: Arc<LockService>,
    status: Arc<StatusManager>,
    queue: TaskQueue,
    supervisor: Supervisor,
    processed_issues: BTreeSet<u64>,
    processed_comments: BTreeMap<u64, BTreeSet<u64>>,
    /// Tasks currently handed to the supervisor, kept for the completion
    /// path (keyword scan of the original request, retry re-enqueue).
    active: HashMap<String, Task>,
    /// Retry-scheduled tasks waiting for their delay to elapse.
    deferred: Vec<(u64, Task)>,
    /// Completions whose comment could not be posted yet; retried next
    /// tick so the comment always precedes the terminal label.
    unposted: Vec<Completion>,
    issues_seen: usize,
    tasks_spawned: usize,
    tasks_completed: usize,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        let processed_issues = deps.store.load_processed_issues();
        let processed_comments = deps.store.load_processed_comments();
        Self {
            config: deps.config,
            forge: deps.forge,
            store: deps.store,
            limiter: deps.limiter,
            retry: RetryPolicy::new(),
            locks: deps.locks,
            status: deps.status,
            queue: deps.queue,
            supervisor: deps.supervisor,
            processed_issues,
            processed_comments,
            active: HashMap::new(),
            deferred: Vec::new(),
            unposted: Vec::new(),
            issues_seen: 0,
            tasks_spawned: 0,
            tasks_completed: 0,
        }
    }

    /// Run until `shutdown` cancels: recover, then tick at the polling
    /// interval. Children are left running on shutdown.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        self.recover().await;

        loop {
            self.tick().await;
            let interval = self.config.poll_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.persist_for_shutdown();
        info!("dispatcher stopped; children keep running");
    }

    /// Startup recovery: reclaim the in-flight table and re-enqueue the
    /// queue snapshot after revalidating each task against the forge.
    pub async fn recover(&mut self) {
        let completions = self.supervisor.recover();
        if !completions.is_empty() {
            self.handle_completions(completions).await;
        }

        let snapshot = TaskQueue::load_snapshot(&self.store);
        for task in snapshot {
            match self.revalidate(&task).await {
                Ok(true) => {
                    let external = self.external_dedup();
                    if let Err(e) = self.queue.enqueue(task, &external) {
                        debug!(err = %e, "restored task not re-enqueued");
                    }
                }
                Ok(false) => {
                    info!(task_id = %task.task_id, "dropping stale restored task");
                }
                Err(e) => {
                    // Forge unreachable: keep the task, the next poll will
                    // see the issue again anyway.
                    warn!(task_id = %task.task_id, err = %e.to_string(), "revalidation failed");
                    let external = self.external_dedup();
                    let _ = self.queue.enqueue(task, &external);
                }
            }
        }
    }

    /// One dispatcher tick; public for the scenario tests.
    pub async fn tick(&mut self) {
        let settings = self.config.snapshot();

        // 1. While the forge is limited we stop fetching and spawning, but
        //    completions and heartbeats keep flowing.
        let limit = self.limiter.check(Channel::Forge);
        if limit.limited {
            info!(wait_ms = limit.wait.as_millis() as u64, "forge rate limited; pausing polls");
        } else {
            // 2.–4. Fetch, filter, enqueue.
            self.poll_issues(&settings).await;
            // 5. Follow-up comments on awaiting-response issues.
            if settings.follow_ups_enabled {
                self.poll_follow_ups(&settings).await;
            }
        }

        self.promote_deferred();

        // 6. Drain the queue into the supervisor.
        self.drain(&settings).await;

        // 7. Process completions (and comments that failed to post).
        let completions = self.supervisor.poll_completed();
        let mut pending = std::mem::take(&mut self.unposted);
        pending.extend(completions);
        if !pending.is_empty() {
            self.handle_completions(pending).await;
        }

        // 8. Heartbeats run in their own loop (see `run::spawn_heartbeat`),
        //    at the configured cadence rather than the poll interval.

        // 9. Persist incremental state.
        self.persist_all();
        self.store_last_run();
    }

    fn external_dedup(&self) -> ExternalDedup {
        ExternalDedup {
            running_task_ids: self.supervisor.running_task_ids(),
            processing_issues: self
                .status
                .processing()
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
        }
    }

    fn eligible(&self, issue: &Issue, settings: &Settings) -> bool {
        if issue.author != settings.owner {
            return false;
        }
        if !settings.task_labels.iter().any(|l| issue.has_label(l)) {
            return false;
        }
        if issue.has_label(LABEL_COMPLETED) || issue.has_label(LABEL_PROCESSING) {
            return false;
        }
        if self.processed_issues.contains(&issue.number) {
            return false;
        }
        true
    }

    async fn poll_issues(&mut self, settings: &Settings) {
        let issues = match self.forge.list_issues("open", &[]).await {
            Ok(issues) => issues,
            Err(e) => {
                self.note_forge_error("list_issues", &e);
                return;
            }
        };
        self.issues_seen = issues.len();

        for issue in issues {
            if !self.eligible(&issue, settings) {
                continue;
            }
            let item = WorkItem {
                id: issue.number,
                comment_id: None,
                title: issue.title.clone(),
                body: issue.body.clone(),
                labels: issue.labels.clone(),
                author: issue.author.clone(),
                kind: ItemKind::Initial,
            };
            let task = Task::new(item, PRIORITY_INITIAL, epoch_ms());
            self.try_enqueue(task);
        }
    }

    async fn poll_follow_ups(&mut self, settings: &Settings) {
        let awaiting = match self
            .forge
            .list_issues("open", &[LABEL_AWAITING_RESPONSE.to_owned()])
            .await
        {
            Ok(issues) => issues,
            Err(e) => {
                self.note_forge_error("list_issues(awaiting)", &e);
                return;
            }
        };

        for issue in awaiting {
            if issue.author != settings.owner {
                continue;
            }
            let comments = match self.forge.list_comments(issue.number).await {
                Ok(comments) => comments,
                Err(e) => {
                    self.note_forge_error("list_comments", &e);
                    continue;
                }
            };
            let seen = self.processed_comments.entry(issue.number).or_default().clone();
            for comment in comments {
                if comment.author != settings.owner || seen.contains(&comment.id) {
                    continue;
                }
                let item = WorkItem {
                    id: issue.number,
                    comment_id: Some(comment.id),
                    title: issue.title.clone(),
                    body: comment.body.clone(),
                    labels: issue.labels.clone(),
                    author: comment.author.clone(),
                    kind: ItemKind::FollowUp,
                };
                let task = Task::new(item, PRIORITY_FOLLOW_UP, epoch_ms());
                self.try_enqueue(task);
            }
        }
    }

    /// Enqueue with dedup; on success mark the item processed so later
    /// polls skip it. A full queue leaves the item unmarked — it stays
    /// eligible next tick.
    fn try_enqueue(&mut self, task: Task) {
        let external = self.external_dedup();
        let issue_id = task.issue_id();
        let comment_id = task.item.comment_id;
        match self.queue.enqueue(task, &external) {
            Ok(()) => match comment_id {
                Some(cid) => {
                    self.processed_comments.entry(issue_id).or_default().insert(cid);
                }
                None => {
                    self.processed_issues.insert(issue_id);
                }
            },
            Err(QueueError::Duplicate { task_id }) => {
                debug!(%task_id, "duplicate suppressed");
            }
            Err(QueueError::Full { capacity }) => {
                debug!(issue_id, capacity, "queue full; item stays eligible");
            }
        }
    }

    /// Move retry-delayed tasks whose delay elapsed back into the queue.
    fn promote_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let now = epoch_ms();
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.deferred).into_iter().partition(|(at, _)| *at <= now);
        self.deferred = waiting;
        for (_, task) in ready {
            let external = self.external_dedup();
            if let Err(e) = self.queue.enqueue(task, &external) {
                debug!(err = %e, "deferred task not re-enqueued");
            }
        }
    }

    async fn drain(&mut self, settings: &Settings) {
        loop {
            let limited = self.limiter.check(Channel::Forge).limited;
            let running = self.supervisor.running_count();
            let locks = Arc::clone(&self.locks);
            let acquirable = move |issue_id: u64| locks.acquirable(issue_id);
            let gates = DequeueGates {
                running,
                max_concurrent: self.config.max_concurrent(),
                limited,
                lock_acquirable: &acquirable,
            };
            let Some(task) = self.queue.dequeue(&gates) else {
                break;
            };
            self.start_task(task, settings).await;
        }
    }

    /// Lock → checkout → spawn, releasing everything taken so far when a
    /// later step fails.
    async fn start_task(&mut self, mut task: Task, settings: &Settings) {
        let issue_id = task.issue_id();
        let task_id = task.task_id.clone();

        // The queued snapshot may be stale; re-fetch before executing.
        match self.forge.get_issue(issue_id).await {
            Ok(issue) if !issue.is_open() => {
                info!(task_id = %task_id, "issue closed since enqueue; dropping task");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let kind = e.kind();
                self.note_forge_error("get_issue", &e);
                if kind == ErrorKind::RateLimit {
                    // Park on the per-task back-off; past its cap the task
                    // is dropped rather than retried forever.
                    if let Err(exhausted) =
                        self.limiter.wait_with_backoff(&task_id, "forge rate limited").await
                    {
                        warn!(task_id = %task_id, err = %exhausted, "giving up on task");
                        return;
                    }
                }
                self.defer_for_retry(task, kind);
                return;
            }
        }

        if let Err(e) = self.locks.acquire(issue_id, &task_id) {
            // LockHeld is never retried directly; the item comes back via
            // the next poll.
            debug!(task_id = %task_id, err = %e, "lock unavailable at start");
            return;
        }

        if let Err(e) = self.status.checkout(issue_id, &task_id, task.item.kind.as_str()) {
            warn!(task_id = %task_id, err = %e, "checkout refused; dropping task");
            self.locks.release(issue_id, &task_id);
            return;
        }

        task.attempts += 1;
        let prompt = build_prompt(&task.item);
        match self.supervisor.execute(
            &task,
            prompt,
            ExecuteOptions { skip_lock_acquisition: true },
        ) {
            Ok(spawned) => {
                self.status.set_pid(issue_id, spawned.pid);
                self.active.insert(task_id, task);
                self.tasks_spawned += 1;
            }
            Err(e) => {
                let kind = e.kind();
                warn!(task_id = %task_id, err = %e, "spawn failed");
                let _ = self.status.reset(issue_id);
                self.locks.release(issue_id, &task_id);
                self.defer_for_retry(task, kind);
            }
        }
    }

    fn defer_for_retry(&mut self, task: Task, kind: ErrorKind) {
        if !self.retry.should_retry(&task.task_id, kind) {
            info!(task_id = %task.task_id, kind = kind.as_str(), "giving up on task");
            return;
        }
        let delay = self.retry.next_delay(&task.task_id, kind);
        debug!(task_id = %task.task_id, delay_ms = delay.as_millis() as u64, "deferring retry");
        self.deferred.push((epoch_ms() + delay.as_millis() as u64, task));
    }

    async fn handle_completions(&mut self, completions: Vec<Completion>) {
        for completion in completions {
            let settings = self.config.snapshot();
            if completion.result.success {
                self.handle_success(completion, &settings).await;
            } else {
                self.handle_failure(completion, &settings).await;
            }
        }
    }

    async fn handle_success(&mut self, completion: Completion, settings: &Settings) {
        let issue_id = completion.issue_id;
        let body = format!(
            "{}\n\n{}",
            settings.success_comment_header,
            completion.result.output.trim_end()
        );
        if let Err(e) = self.forge.add_comment(issue_id, &body).await {
            self.note_forge_error("add_comment", &e);
            if self.retry.should_retry(&completion.task_id, e.kind()) {
                // Comment must land before the terminal label; try again
                // next tick.
                self.unposted.push(completion);
            } else {
                warn!(task_id = %completion.task_id, "comment never posted; finishing anyway");
                self.finish_success(completion, settings);
            }
            return;
        }
        self.finish_success(completion, settings);
    }

    fn finish_success(&mut self, completion: Completion, settings: &Settings) {
        let issue_id = completion.issue_id;
        let task = self.active.remove(&completion.task_id);

        // Keyword in the child's output or the original request short-
        // circuits straight to completed; otherwise follow-ups (when
        // enabled) park the issue awaiting a human reply.
        let keyword_hit = contains_completion_keyword(
            &completion.result.output,
            &settings.completion_keywords,
        ) || task
            .as_ref()
            .map(|t| contains_completion_keyword(&t.item.body, &settings.completion_keywords))
            .unwrap_or(false);
        let new_state = if !settings.follow_ups_enabled || keyword_hit {
            IssueState::Completed
        } else {
            IssueState::AwaitingResponse
        };

        if let Err(e) =
            self.status.checkin(issue_id, new_state, Some(completion.result.output.clone()))
        {
            warn!(issue_id, err = %e, "checkin failed");
        }
        self.retry.forget(&completion.task_id);
        self.limiter.reset_backoff(&completion.task_id);
        self.tasks_completed += 1;
        info!(task_id = %completion.task_id, state = new_state.as_str(), "task completed");
    }

    async fn handle_failure(&mut self, completion: Completion, settings: &Settings) {
        let issue_id = completion.issue_id;
        let kind = ErrorKind::SubprocessCrash;
        let log_path = self.store.paths().output_file(&completion.task_id);
        let will_retry =
            kind.retryable() && self.retry.attempts(&completion.task_id) < 2;
        let body = format!(
            "{}\n\n{} (`{}`)\n\nretry possible: {}\nlog: `{}`",
            settings.error_comment_header,
            if completion.result.error.is_empty() {
                "task failed".to_owned()
            } else {
                completion.result.error.clone()
            },
            kind.as_str(),
            will_retry,
            log_path.display(),
        );
        if let Err(e) = self.forge.add_comment(issue_id, &body).await {
            self.note_forge_error("add_comment", &e);
            if self.retry.should_retry(&completion.task_id, e.kind()) {
                self.unposted.push(completion);
                return;
            }
        }

        if let Err(e) = self.status.reset(issue_id) {
            warn!(issue_id, err = %e, "status reset failed");
        }

        if let Some(task) = self.active.remove(&completion.task_id) {
            self.defer_for_retry(task, kind);
        } else {
            debug!(task_id = %completion.task_id, "no active task to retry (restarted parent)");
        }
        self.tasks_completed += 1;
        warn!(task_id = %completion.task_id, "task failed");
    }

    /// Restored tasks must still point at an open issue that carries a
    /// required task label.
    async fn revalidate(&self, task: &Task) -> Result<bool, crate::forge::ForgeError> {
        let settings = self.config.snapshot();
        let issue = match self.forge.get_issue(task.issue_id()).await {
            Ok(issue) => issue,
            Err(crate::forge::ForgeError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !issue.is_open() {
            return Ok(false);
        }
        if task.item.comment_id.is_none()
            && !settings.task_labels.iter().any(|l| issue.has_label(l))
        {
            return Ok(false);
        }
        Ok(true)
    }

    fn note_forge_error(&self, op: &str, err: &crate::forge::ForgeError) {
        match err.kind() {
            // The limiter already recorded the hold via the client.
            ErrorKind::RateLimit => debug!(op, "forge rate limited"),
            ErrorKind::Auth => warn!(op, "forge rejected credentials; pausing until retry"),
            _ => warn!(op, err = %err.to_string(), "forge call failed"),
        }
    }

    fn persist_all(&mut self) {
        if let Err(e) = self.store.save_processed_issues(&self.processed_issues) {
            warn!(err = %e, "failed to persist processed issues");
        }
        if let Err(e) = self.store.save_processed_comments(&self.processed_comments) {
            warn!(err = %e, "failed to persist processed comments");
        }
        self.queue.persist_if_dirty();
    }

    fn store_last_run(&mut self) {
        let last_run = LastRun {
            finished_at: epoch_ms(),
            issues_seen: self.issues_seen,
            tasks_spawned: self.tasks_spawned,
            tasks_completed: self.tasks_completed,
        };
        if let Err(e) = self.store.save_last_run(&last_run) {
            warn!(err = %e, "failed to persist last-run metadata");
        }
    }

    /// Flush everything before exit; called on shutdown.
    pub fn persist_for_shutdown(&mut self) {
        self.queue.flush();
        self.persist_all();
    }

    // Test accessors.
    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }
}

/// Render the instruction prompt handed to the AI CLI.
fn build_prompt(item: &WorkItem) -> String {
    match item.kind {
        ItemKind::Initial => format!("# {} (#{})\n\n{}", item.title, item.id, item.body),
        ItemKind::FollowUp => {
            format!("# Follow-up on {} (#{})\n\n{}", item.title, item.id, item.body)
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
