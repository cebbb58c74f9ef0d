// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios across the dispatcher, supervisor, status
//! manager, lock service, and label arbiter, backed by real state
//! directories and the fake forge.

use poppo::status::IssueState;
use poppo::store::epoch_ms;
use poppo::test_support::{open_issue, FailWith};

use poppo_specs::World;

// -- Scenario A: happy path ---------------------------------------------------

#[tokio::test]
async fn happy_path_from_poll_to_completed_labels() -> anyhow::Result<()> {
    let mut world = World::with_settings(|s| s.follow_ups_enabled = false)?;
    world.forge.put_issue(open_issue(42, "alice", &["task:misc"]));

    // Tick 1: lock taken, child spawned, processing label requested.
    world.dispatcher.tick().await;
    assert!(world.inflight().contains_key("issue-42"));
    assert!(!world.locks.acquirable(42));
    world.arbiter().process_requests().await;
    assert!(world.forge.labels_of(42).contains(&"processing".to_owned()));

    // The child finishes; tick 2 posts the comment and checks in.
    world.finish_task("issue-42", true, "done")?;
    world.dispatcher.tick().await;

    let posted = world.forge.posted_comments();
    assert_eq!(posted, vec![(42, "## Completed\n\ndone".to_owned())]);
    assert_eq!(world.status.state_of(42), IssueState::Completed);

    // The arbiter reconciles the terminal label state.
    world.arbiter().process_requests().await;
    assert_eq!(world.forge.labels_of(42), vec!["task:misc", "completed"]);

    // Artifacts are gone, the lock is free, the item is processed.
    assert!(!world.store.paths().result_file("issue-42").exists());
    assert!(!world.store.paths().pid_file("issue-42").exists());
    assert!(world.locks.acquirable(42));
    assert!(world.store.load_processed_issues().contains(&42));
    assert!(world.inflight().is_empty());
    Ok(())
}

// -- Scenario B: duplicate suppression ----------------------------------------

#[tokio::test]
async fn running_task_is_not_reenqueued() -> anyhow::Result<()> {
    let mut world = World::new()?;
    world.forge.put_issue(open_issue(42, "alice", &["task:misc"]));

    world.dispatcher.tick().await;
    let pid_before = world.inflight().get("issue-42").map(|e| e.pid);
    let requests_before =
        poppo::labels::list_requests(world.store.paths()).len();

    world.dispatcher.tick().await;

    let table = world.inflight();
    assert_eq!(table.len(), 1, "no second child spawned");
    assert_eq!(table.get("issue-42").map(|e| e.pid), pid_before);
    assert_eq!(
        poppo::labels::list_requests(world.store.paths()).len(),
        requests_before,
        "no additional label requests"
    );

    world.kill_leftover_children();
    Ok(())
}

// -- Scenario C: crash recovery -----------------------------------------------

#[tokio::test]
async fn parent_restart_reclaims_live_children() -> anyhow::Result<()> {
    let world = World::new()?;
    world.forge.put_issue(open_issue(42, "alice", &["task:misc"]));

    // First incarnation spawns the child, then "dies" (dropped without
    // any shutdown path — the detached child keeps running).
    let mut first = world;
    first.dispatcher.tick().await;
    let entry = first.inflight().get("issue-42").cloned();
    let pid = entry.map(|e| e.pid).unwrap_or(0);
    assert!(pid > 0);
    assert!(poppo::process::is_process_alive(pid));
    let World { dir, forge, store, status, locks, .. } = first;
    drop(status);

    // Second incarnation over the same state root.
    let mut second = poppo_specs::rebuild_world(dir, forge, store, locks)?;
    second.dispatcher.recover().await;
    assert!(second.inflight().contains_key("issue-42"), "entry preserved");
    assert_eq!(second.status.state_of(42), IssueState::Processing);

    // The child completes after the restart; the normal path runs.
    second.finish_task("issue-42", true, "done")?;
    second.dispatcher.tick().await;
    assert_eq!(second.forge.posted_comments().len(), 1);
    assert_eq!(second.status.state_of(42), IssueState::Completed);

    poppo::process::terminate(pid);
    Ok(())
}

// -- Scenario D: orphan sweep -------------------------------------------------

#[tokio::test]
async fn orphan_sweep_recovers_crashed_child() -> anyhow::Result<()> {
    let world = World::new()?;
    world.forge.put_issue(open_issue(77, "alice", &["task:misc", "processing"]));

    // A processing checkout whose child died without a result and whose
    // heartbeat has gone stale.
    world.locks.acquire(77, "issue-77")?;
    world.status.checkout(77, "issue-77", "initial")?;
    world.status.set_pid(77, 4_000_000_000);
    // Drain the checkout's own label request first.
    world.arbiter().process_requests().await;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let arbiter = world.arbiter().with_heartbeat_timeout(std::time::Duration::ZERO);
    let recovered = arbiter.sweep_orphans().await;

    assert_eq!(recovered, 1);
    assert_eq!(world.status.state_of(77), IssueState::Error);
    assert!(!world.forge.labels_of(77).contains(&"processing".to_owned()));
    assert!(world.locks.acquirable(77), "lock released");
    // The record stays for audit.
    let record = world.status.get(77).ok_or_else(|| anyhow::anyhow!("record missing"))?;
    assert!(record.result.unwrap_or_default().contains("orphaned"));
    Ok(())
}

// -- Scenario E: rate limit ---------------------------------------------------

#[tokio::test]
async fn rate_limit_pauses_polls_but_not_completions() -> anyhow::Result<()> {
    let mut world = World::new()?;
    world.forge.put_issue(open_issue(42, "alice", &["task:misc"]));
    world.dispatcher.tick().await;
    world.finish_task("issue-42", true, "done")?;

    // The forge now reports 429s; a new issue appears meanwhile.
    world.forge.put_issue(open_issue(43, "alice", &["task:misc"]));
    world
        .limiter
        .record_limited(poppo::limiter::Channel::Forge, Some(epoch_ms() + 60_000));
    world.forge.fail_next("list_issues", FailWith::RateLimited { reset_at: None });

    world.dispatcher.tick().await;

    // No enqueue happened for the new issue...
    assert!(!world.store.load_processed_issues().contains(&43));
    // ...while the running child's completion was still processed.
    assert_eq!(world.status.state_of(42), IssueState::Completed);
    assert_eq!(world.forge.posted_comments().len(), 1);
    Ok(())
}

// -- Scenario F: follow-up comment --------------------------------------------

#[tokio::test]
async fn follow_up_with_keyword_completes_directly() -> anyhow::Result<()> {
    let mut world = World::new()?;
    world
        .forge
        .put_issue(open_issue(42, "alice", &["task:misc", "awaiting-response"]));
    let cid = world.forge.user_comment(42, "alice", "thanks, ship it");

    world.dispatcher.tick().await;
    let task_id = format!("issue-42-comment-{cid}");
    assert!(world.inflight().contains_key(&task_id), "follow-up task spawned");

    world.finish_task(&task_id, true, "shipped")?;
    world.dispatcher.tick().await;

    // "thanks" in the original request routes straight to completed.
    assert_eq!(world.status.state_of(42), IssueState::Completed);
    world.arbiter().process_requests().await;
    let labels = world.forge.labels_of(42);
    assert!(labels.contains(&"completed".to_owned()));
    assert!(!labels.contains(&"awaiting-response".to_owned()));
    assert!(!labels.contains(&"processing".to_owned()));

    world.kill_leftover_children();
    Ok(())
}

// -- Restart resilience of persisted state ------------------------------------

#[tokio::test]
async fn processed_sets_survive_restart() -> anyhow::Result<()> {
    let mut world = World::with_settings(|s| s.follow_ups_enabled = false)?;
    world.forge.put_issue(open_issue(42, "alice", &["task:misc"]));
    world.dispatcher.tick().await;
    world.finish_task("issue-42", true, "done")?;
    world.dispatcher.tick().await;

    let World { dir, forge, store, locks, .. } = world;
    let mut second = poppo_specs::rebuild_world(dir, forge, store, locks)?;
    second.dispatcher.tick().await;

    // The completed issue is not picked up again.
    assert!(second.inflight().is_empty());
    assert_eq!(second.forge.posted_comments().len(), 1);
    Ok(())
}
