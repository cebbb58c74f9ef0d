// SPDX-License-Identifier: BUSL-1.1
// Copyright 2026 Alfred Jean LLC

//! Test harness for the end-to-end scenario and smoke tests.
//!
//! [`World`] wires a real dispatcher, arbiter, status manager, and lock
//! service over a throwaway state root and the in-memory fake forge; the
//! smoke tests spawn the compiled `poppo` binary instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use poppo::arbiter::Arbiter;
use poppo::config::{ConfigHandle, Settings};
use poppo::dispatch::{Dispatcher, DispatcherDeps};
use poppo::forge::Forge;
use poppo::limiter::RateLimiter;
use poppo::lock::LockService;
use poppo::queue::TaskQueue;
use poppo::status::StatusManager;
use poppo::store::{StateStore, StorePaths};
use poppo::supervisor::{InflightTable, Supervisor};
use poppo::test_support::FakeForge;
use poppo::worker::TaskResult;

/// Resolve the path to the compiled `poppo` binary.
pub fn poppo_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("poppo")
}

/// Default settings for a scenario run, rooted in `base`.
pub fn scenario_settings(base: &Path) -> Settings {
    Settings {
        owner: "alice".to_owned(),
        repo: "widgets".to_owned(),
        forge_url: "https://forge.example".to_owned(),
        token: "t0ken".to_owned(),
        task_labels: vec!["task:misc".to_owned()],
        poll_interval_secs: 60,
        max_concurrent: 2,
        queue_capacity: 100,
        follow_ups_enabled: true,
        completion_keywords: vec!["thanks".to_owned(), "done".to_owned()],
        success_comment_header: "## Completed".to_owned(),
        error_comment_header: "## Error".to_owned(),
        notifications_enabled: false,
        agent_command: vec!["claude".to_owned()],
        base_dir: base.join("state"),
        temp_dir: base.join("temp"),
        log_level: "info".to_owned(),
        log_format: "text".to_owned(),
        rate_limit_hold_secs: 60,
        heartbeat_interval_secs: 30,
        heartbeat_timeout_secs: 300,
        lock_ttl_secs: 300,
        lock_sweep_interval_secs: 600,
        arbiter_poll_secs: 5,
        orphan_sweep_interval_secs: 1800,
        task_timeout_hours: 24,
    }
}

/// A fully wired engine over a temp state root and a fake forge.
///
/// Workers are a shell script that sleeps; tests settle tasks by writing
/// result artifacts, exactly the signal a real worker produces.
pub struct World {
    pub dir: tempfile::TempDir,
    pub forge: Arc<FakeForge>,
    pub store: Arc<StateStore>,
    pub status: Arc<StatusManager>,
    pub locks: Arc<LockService>,
    pub limiter: Arc<RateLimiter>,
    pub config: ConfigHandle,
    pub dispatcher: Dispatcher,
}

impl World {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(mutate: impl FnOnce(&mut Settings)) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut settings = scenario_settings(dir.path());
        mutate(&mut settings);

        let paths = StorePaths::new(&settings.base_dir, &settings.temp_dir);
        paths.ensure()?;
        let store = Arc::new(StateStore::new(paths.clone()));
        let forge = Arc::new(FakeForge::new());
        let status = Arc::new(StatusManager::new(Arc::clone(&store)));
        let locks = Arc::new(LockService::new(paths.clone()).with_ttl(settings.lock_ttl()));
        let limiter = Arc::new(RateLimiter::new());
        let config = ConfigHandle::new(settings.clone());

        let queue = TaskQueue::new(Arc::clone(&store), settings.queue_capacity)
            .with_debounce(Duration::ZERO);
        let supervisor = Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            sleeper_exe(&paths)?,
            settings.agent_command.clone(),
        );

        let dispatcher = Dispatcher::new(DispatcherDeps {
            config: config.clone(),
            forge: Arc::clone(&forge) as Arc<dyn Forge>,
            store: Arc::clone(&store),
            limiter: Arc::clone(&limiter),
            locks: Arc::clone(&locks),
            status: Arc::clone(&status),
            queue,
            supervisor,
        });

        Ok(Self { dir, forge, store, status, locks, limiter, config, dispatcher })
    }

    pub fn arbiter(&self) -> Arbiter {
        Arbiter::new(
            Arc::clone(&self.forge) as Arc<dyn Forge>,
            Arc::clone(&self.store),
            Arc::clone(&self.status),
            Arc::clone(&self.locks),
        )
    }

    /// The persisted in-flight table, as a restarted parent would see it.
    pub fn inflight(&self) -> InflightTable {
        self.store.load_json_or_default(&self.store.paths().running_tasks())
    }

    /// Settle a running task the way a finished worker does.
    pub fn finish_task(&self, task_id: &str, success: bool, output: &str) -> anyhow::Result<()> {
        let result = TaskResult {
            task_id: task_id.to_owned(),
            exit_code: if success { 0 } else { 1 },
            success,
            output: output.to_owned(),
            error: if success { String::new() } else { "agent crashed".to_owned() },
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
        poppo::worker::write_result(&self.store.paths().result_file(task_id), &result)?;
        Ok(())
    }

    /// Terminate any children still recorded in the in-flight table.
    pub fn kill_leftover_children(&self) {
        for entry in self.inflight().values() {
            poppo::process::terminate(entry.pid);
        }
    }
}

/// Rebuild a [`World`] over an existing state root, as a restarted
/// daemon process would: status records and the in-flight table reload
/// from disk, the forge keeps its state.
pub fn rebuild_world(
    dir: tempfile::TempDir,
    forge: Arc<FakeForge>,
    store: Arc<StateStore>,
    locks: Arc<LockService>,
) -> anyhow::Result<World> {
    let settings = scenario_settings(dir.path());
    let paths = store.paths().clone();
    let status = Arc::new(StatusManager::new(Arc::clone(&store)));
    let limiter = Arc::new(RateLimiter::new());
    let config = ConfigHandle::new(settings.clone());

    let queue = TaskQueue::new(Arc::clone(&store), settings.queue_capacity)
        .with_debounce(Duration::ZERO);
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        sleeper_exe(&paths)?,
        settings.agent_command.clone(),
    );

    let dispatcher = Dispatcher::new(DispatcherDeps {
        config: config.clone(),
        forge: Arc::clone(&forge) as Arc<dyn Forge>,
        store: Arc::clone(&store),
        limiter: Arc::clone(&limiter),
        locks: Arc::clone(&locks),
        status: Arc::clone(&status),
        queue,
        supervisor,
    });

    Ok(World { dir, forge, store, status, locks, limiter, config, dispatcher })
}

fn sleeper_exe(paths: &StorePaths) -> anyhow::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = paths.temp_root().join("fake-worker.sh");
    std::fs::write(&path, "#!/bin/sh\nsleep 30\n")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
