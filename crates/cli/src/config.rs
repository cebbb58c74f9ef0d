// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration: CLI flags, layered JSON config files, and hot reload.
//!
//! Resolution order is built-in defaults ← global config file ← project
//! config file ← environment/CLI, one explicit merge per key. Unknown
//! file keys warn instead of failing. A subset of keys is hot-reloadable
//! through the file watcher; everything else logs `restart required` and
//! keeps its old value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default labels that make an issue eligible.
pub const DEFAULT_TASK_LABELS: &[&str] =
    &["task:misc", "task:dogfooding", "task:quality", "task:docs", "task:feature"];

#[derive(Debug, Parser)]
#[command(name = "poppo", version, about = "Autonomous forge task dispatcher.")]
pub struct Cli {
    #[command(flatten)]
    pub args: CliArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Detached task executor; spawned by the daemon, not for direct use.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, clap::Args)]
pub struct WorkerArgs {
    /// Path to the instruction artifact.
    #[arg(long)]
    pub instruction: PathBuf,
}

#[derive(Debug, Clone, clap::Args)]
pub struct CliArgs {
    /// Path to the global config file.
    #[arg(long, env = "POPPOBUILDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// State directory root.
    #[arg(long, env = "POPPOBUILDER_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Forge API token.
    #[arg(long, env = "FORGE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "POPPO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "POPPO_LOG_FORMAT")]
    pub log_format: Option<String>,
}

/// One config file layer. Every key optional; unknown keys are collected
/// for a warning rather than rejected.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub forge_url: Option<String>,
    pub task_labels: Option<Vec<String>>,
    pub poll_interval_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub follow_ups_enabled: Option<bool>,
    pub completion_keywords: Option<Vec<String>>,
    pub success_comment_header: Option<String>,
    pub error_comment_header: Option<String>,
    pub notifications_enabled: Option<bool>,
    pub agent_command: Option<Vec<String>>,
    pub temp_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub rate_limit_hold_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub lock_ttl_secs: Option<u64>,
    pub lock_sweep_interval_secs: Option<u64>,
    pub arbiter_poll_secs: Option<u64>,
    pub orphan_sweep_interval_secs: Option<u64>,
    pub task_timeout_hours: Option<u64>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// Load one config layer, warning about unknown keys. A missing file is
/// the empty layer.
pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(e) => return Err(e.into()),
    };
    let config: FileConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("invalid config file {}: {e}", path.display()))?;
    for key in config.unknown.keys() {
        warn!(path = %path.display(), key, "unknown config key ignored");
    }
    Ok(config)
}

/// Fully resolved settings for one daemon run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub owner: String,
    pub repo: String,
    pub forge_url: String,
    pub token: String,
    pub task_labels: Vec<String>,
    pub poll_interval_secs: u64,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub follow_ups_enabled: bool,
    pub completion_keywords: Vec<String>,
    pub success_comment_header: String,
    pub error_comment_header: String,
    pub notifications_enabled: bool,
    pub agent_command: Vec<String>,
    pub base_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
    pub rate_limit_hold_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub arbiter_poll_secs: u64,
    pub orphan_sweep_interval_secs: u64,
    pub task_timeout_hours: u64,
}

/// State root: `--base-dir` / `POPPOBUILDER_BASE_DIR`, else the XDG
/// state directory.
pub fn resolve_base_dir(cli: &CliArgs) -> PathBuf {
    cli.base_dir.clone().unwrap_or_else(default_base_dir)
}

fn default_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(dir).join("poppo");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local").join("state").join("poppo"),
        Err(_) => PathBuf::from(".poppo"),
    }
}

macro_rules! layered {
    ($global:expr, $project:expr, $field:ident, $default:expr) => {
        $project.$field.clone().or_else(|| $global.$field.clone()).unwrap_or_else(|| $default)
    };
}

impl Settings {
    /// Merge defaults ← global ← project ← CLI/env into one settings
    /// value. Fails on missing required keys (token, owner, repo).
    pub fn resolve(
        cli: &CliArgs,
        global: &FileConfig,
        project: &FileConfig,
    ) -> anyhow::Result<Self> {
        let token = cli
            .token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("FORGE_TOKEN is required"))?;
        let owner = project
            .owner
            .clone()
            .or_else(|| global.owner.clone())
            .ok_or_else(|| anyhow::anyhow!("config key `owner` is required"))?;
        let repo = project
            .repo
            .clone()
            .or_else(|| global.repo.clone())
            .ok_or_else(|| anyhow::anyhow!("config key `repo` is required"))?;

        let base_dir = resolve_base_dir(cli);
        let settings = Self {
            owner,
            repo,
            token,
            forge_url: layered!(global, project, forge_url, "https://api.github.com".to_owned()),
            task_labels: layered!(
                global,
                project,
                task_labels,
                DEFAULT_TASK_LABELS.iter().map(|s| (*s).to_owned()).collect()
            ),
            poll_interval_secs: layered!(global, project, poll_interval_secs, 60),
            max_concurrent: layered!(global, project, max_concurrent, 2),
            queue_capacity: layered!(global, project, queue_capacity, 100),
            follow_ups_enabled: layered!(global, project, follow_ups_enabled, true),
            completion_keywords: layered!(
                global,
                project,
                completion_keywords,
                vec![
                    "thanks".to_owned(),
                    "done".to_owned(),
                    "resolved".to_owned(),
                    "completed".to_owned(),
                ]
            ),
            success_comment_header: layered!(
                global,
                project,
                success_comment_header,
                "## Completed".to_owned()
            ),
            error_comment_header: layered!(
                global,
                project,
                error_comment_header,
                "## Error".to_owned()
            ),
            notifications_enabled: layered!(global, project, notifications_enabled, false),
            agent_command: layered!(global, project, agent_command, vec!["claude".to_owned()]),
            temp_dir: layered!(
                global,
                project,
                temp_dir,
                std::env::temp_dir().join("poppo")
            ),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| project.log_level.clone())
                .or_else(|| global.log_level.clone())
                .unwrap_or_else(|| "info".to_owned()),
            log_format: cli
                .log_format
                .clone()
                .or_else(|| project.log_format.clone())
                .or_else(|| global.log_format.clone())
                .unwrap_or_else(|| "json".to_owned()),
            rate_limit_hold_secs: layered!(global, project, rate_limit_hold_secs, 60),
            heartbeat_interval_secs: layered!(global, project, heartbeat_interval_secs, 30),
            heartbeat_timeout_secs: layered!(global, project, heartbeat_timeout_secs, 300),
            lock_ttl_secs: layered!(global, project, lock_ttl_secs, 300),
            lock_sweep_interval_secs: layered!(global, project, lock_sweep_interval_secs, 600),
            arbiter_poll_secs: layered!(global, project, arbiter_poll_secs, 5),
            orphan_sweep_interval_secs: layered!(
                global,
                project,
                orphan_sweep_interval_secs,
                1800
            ),
            task_timeout_hours: layered!(global, project, task_timeout_hours, 24),
            base_dir,
        };

        if settings.agent_command.is_empty() {
            anyhow::bail!("config key `agent_command` must not be empty");
        }
        if settings.max_concurrent == 0 {
            anyhow::bail!("config key `max_concurrent` must be at least 1");
        }
        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs)
    }

    pub fn arbiter_poll(&self) -> Duration {
        Duration::from_secs(self.arbiter_poll_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_hours * 60 * 60)
    }

    pub fn rate_limit_hold(&self) -> Duration {
        Duration::from_secs(self.rate_limit_hold_secs)
    }
}

/// Shared view of settings with hot-reload support.
///
/// Hot-reloadable: log level, rate-limit hold, concurrency cap, polling
/// interval, notification toggle. Changes to anything else warn and keep
/// the running value.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Settings>>,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)) }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.read().max_concurrent
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.read().poll_interval()
    }

    /// Apply a freshly resolved settings value, honoring only the
    /// hot-reloadable subset.
    pub fn apply_hot(&self, fresh: Settings) {
        let mut current = self.inner.write();
        let mut changed = Vec::new();

        if fresh.log_level != current.log_level {
            current.log_level = fresh.log_level.clone();
            changed.push("log_level");
        }
        if fresh.rate_limit_hold_secs != current.rate_limit_hold_secs {
            current.rate_limit_hold_secs = fresh.rate_limit_hold_secs;
            changed.push("rate_limit_hold_secs");
        }
        if fresh.max_concurrent != current.max_concurrent {
            current.max_concurrent = fresh.max_concurrent;
            changed.push("max_concurrent");
        }
        if fresh.poll_interval_secs != current.poll_interval_secs {
            current.poll_interval_secs = fresh.poll_interval_secs;
            changed.push("poll_interval_secs");
        }
        if fresh.notifications_enabled != current.notifications_enabled {
            current.notifications_enabled = fresh.notifications_enabled;
            changed.push("notifications_enabled");
        }
        if !changed.is_empty() {
            info!(?changed, "hot-reloaded config keys");
        }

        // Everything else requires a restart; report what the file wants
        // but we won't apply.
        let mut frozen = fresh;
        frozen.log_level = current.log_level.clone();
        frozen.rate_limit_hold_secs = current.rate_limit_hold_secs;
        frozen.max_concurrent = current.max_concurrent;
        frozen.poll_interval_secs = current.poll_interval_secs;
        frozen.notifications_enabled = current.notifications_enabled;
        if frozen != *current {
            warn!("config change requires restart; keeping running values");
        }
    }
}

/// Paths consulted on every (re)load: global config (flag/env or
/// `<base-dir>/config.json`) and the project-local overlay.
pub fn config_paths(cli: &CliArgs, base_dir: &Path) -> (PathBuf, PathBuf) {
    let global = cli.config.clone().unwrap_or_else(|| base_dir.join("config.json"));
    let project = PathBuf::from("poppo.config.json");
    (global, project)
}

/// Re-resolve settings from the current files. Used at startup and by
/// the watcher.
pub fn resolve_from_disk(cli: &CliArgs, base_dir: &Path) -> anyhow::Result<Settings> {
    let (global_path, project_path) = config_paths(cli, base_dir);
    let global = load_file(&global_path)?;
    let project = load_file(&project_path)?;
    Settings::resolve(cli, &global, &project)
}

/// Watch the config files and hot-apply changes until shutdown.
///
/// Uses `notify` events with a polling fallback, the same shape as the
/// artifact watchers elsewhere in the codebase.
pub fn spawn_watcher(handle: ConfigHandle, cli: CliArgs, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let base_dir = handle.snapshot().base_dir.clone();
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::channel::<()>(1);
        let _watcher = setup_notify_watcher(&cli, &base_dir, wake_tx);

        let mut poll = tokio::time::interval(Duration::from_secs(30));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }

            match resolve_from_disk(&cli, &base_dir) {
                Ok(fresh) => handle.apply_hot(fresh),
                Err(e) => warn!(err = %e, "config reload failed, keeping running values"),
            }
        }
    });
}

fn setup_notify_watcher(
    cli: &CliArgs,
    base_dir: &Path,
    wake_tx: tokio::sync::mpsc::Sender<()>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;

    let (global, project) = config_paths(cli, base_dir);
    // Watch parent directories so file creation is seen too.
    for path in [&global, &project] {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let _ = watcher.watch(parent, RecursiveMode::NonRecursive);
    }
    Some(watcher)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
