// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level daemon runner: resolve config, take the process lock, wire
//! the components, spawn the background loops, and drive the dispatcher
//! until a signal arrives.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::arbiter::Arbiter;
use crate::config::{self, CliArgs, ConfigHandle};
use crate::dispatch::{Dispatcher, DispatcherDeps};
use crate::forge::http::HttpForge;
use crate::forge::{Forge, ForgeError};
use crate::limiter::RateLimiter;
use crate::lock::LockService;
use crate::queue::TaskQueue;
use crate::status::StatusManager;
use crate::store::{StateStore, StorePaths};
use crate::supervisor::Supervisor;

/// Exit code for a clean shutdown: 130 after SIGINT, 143 after SIGTERM,
/// 0 otherwise.
const EXIT_SIGINT: i32 = 130;
const EXIT_SIGTERM: i32 = 143;

/// Initialize tracing from the resolved log level/format.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / POPPO_LOG_LEVEL > RUST_LOG > "info".
    let filter = if std::env::var("POPPO_LOG_LEVEL").is_err() && log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match log_format {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the daemon to completion. Returns the process exit code.
pub async fn run(args: CliArgs) -> anyhow::Result<i32> {
    // 1. Resolve settings (defaults ← global ← project ← env/CLI).
    let base_dir = config::resolve_base_dir(&args);
    let settings = config::resolve_from_disk(&args, &base_dir)?;
    init_tracing(&settings.log_level, &settings.log_format);
    info!(owner = %settings.owner, repo = %settings.repo, "starting");

    // 2. State store and the process-level exclusive lock. A held lock is
    //    fatal: exactly one daemon per state root.
    let paths = StorePaths::new(&settings.base_dir, &settings.temp_dir);
    paths.ensure()?;
    let store = Arc::new(StateStore::new(paths.clone()));
    store.acquire_process_lock(Duration::from_secs(5 * 60))?;

    // 3. Forge client and rate limiter; probe limits once before the loop
    //    starts. Auth failures are fatal here, transient ones are not.
    // reqwest is built without a default crypto provider; install ring's.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let limiter = Arc::new(RateLimiter::new().with_default_hold(settings.rate_limit_hold()));
    let forge: Arc<dyn Forge> = Arc::new(HttpForge::new(
        settings.forge_url.clone(),
        settings.owner.clone(),
        settings.repo.clone(),
        settings.token.clone(),
        Arc::clone(&limiter),
    ));
    match forge.list_issues("open", &[]).await {
        Ok(_) => {}
        Err(ForgeError::Auth) => {
            store.release_process_lock();
            anyhow::bail!("forge rejected the configured token");
        }
        Err(e) => warn!(err = %e.to_string(), "preflight forge call failed; continuing"),
    }
    limiter.preflight();

    // 4. Core components.
    let config = ConfigHandle::new(settings.clone());
    let locks = Arc::new(LockService::new(paths.clone()).with_ttl(settings.lock_ttl()));
    let status = Arc::new(StatusManager::new(Arc::clone(&store)));
    let queue = TaskQueue::new(Arc::clone(&store), settings.queue_capacity);
    let worker_exe = std::env::current_exe()?;
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        worker_exe,
        settings.agent_command.clone(),
    )
    .with_max_duration(settings.task_timeout());

    let shutdown = CancellationToken::new();

    // 5. Background loops: arbiter, lock sweeper, config watcher,
    //    heartbeats.
    {
        let arbiter = Arbiter::new(
            Arc::clone(&forge),
            Arc::clone(&store),
            Arc::clone(&status),
            Arc::clone(&locks),
        )
        .with_poll_interval(settings.arbiter_poll())
        .with_sweep_interval(settings.orphan_sweep_interval())
        .with_heartbeat_timeout(settings.heartbeat_timeout());
        let sd = shutdown.clone();
        tokio::spawn(async move {
            arbiter.run(sd).await;
        });
    }
    Arc::clone(&locks).spawn_sweeper(settings.lock_sweep_interval(), shutdown.clone());
    config::spawn_watcher(config.clone(), args.clone(), shutdown.clone());
    spawn_heartbeat(
        Arc::clone(&status),
        Arc::clone(&locks),
        settings.heartbeat_interval(),
        shutdown.clone(),
    );

    // 6. Signal handling: first signal drains, second forces exit.
    let exit_code = Arc::new(AtomicI32::new(0));
    spawn_signal_handler(shutdown.clone(), Arc::clone(&exit_code));

    // 7. The dispatcher loop. Children stay alive across our exit.
    let mut dispatcher = Dispatcher::new(DispatcherDeps {
        config,
        forge,
        store: Arc::clone(&store),
        limiter,
        locks,
        status,
        queue,
        supervisor,
    });
    dispatcher.run(shutdown).await;

    // 8. Drain: state persisted by the dispatcher; drop our lock.
    store.release_process_lock();
    Ok(exit_code.load(Ordering::Acquire))
}

/// Refresh status and lock heartbeats for every processing record.
fn spawn_heartbeat(
    status: Arc<StatusManager>,
    locks: Arc<LockService>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for (issue_id, record) in status.processing() {
                status.update_heartbeat(issue_id);
                if let Some(task_id) = record.process_id {
                    locks.heartbeat(issue_id, &task_id);
                }
            }
        }
    });
}

fn spawn_signal_handler(shutdown: CancellationToken, exit_code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        // First signal: graceful shutdown.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
                exit_code.store(EXIT_SIGTERM, Ordering::Release);
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
                exit_code.store(EXIT_SIGINT, Ordering::Release);
            }
        }
        shutdown.cancel();

        // Second signal: force exit.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGTERM again, forcing exit");
                std::process::exit(EXIT_SIGTERM);
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGINT again, forcing exit");
                std::process::exit(EXIT_SIGINT);
            }
        }
    });
}
