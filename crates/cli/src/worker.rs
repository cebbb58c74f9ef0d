// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker mode: the detached child entry point.
//!
//! The supervisor spawns this binary again as `poppo worker --instruction
//! <path>` in its own process group. The worker runs the AI CLI with the
//! instruction piped on stdin and, as its final act, atomically writes the
//! `.result` artifact — the parent discovers completion by that file
//! appearing, so it must be written on every path, including spawn
//! failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Everything a worker needs, persisted as `instruction-<taskId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstruction {
    pub task_id: String,
    pub issue_id: u64,
    /// Rendered prompt for the AI CLI (title, body, context).
    pub prompt: String,
    /// Agent executable and leading args; the worker appends the
    /// non-interactive flags.
    pub agent_command: Vec<String>,
    pub result_path: PathBuf,
    pub status_path: PathBuf,
}

/// Structured completion record; the `.result` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub exit_code: i32,
    pub success: bool,
    pub output: String,
    pub error: String,
    /// ISO-8601.
    pub completed_at: String,
}

impl TaskResult {
    pub fn interrupted(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            exit_code: -1,
            success: false,
            output: String::new(),
            error: "interrupted".to_owned(),
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Atomic result write: tmp + rename, so the parent never reads a torn
/// artifact.
pub fn write_result(path: &Path, result: &TaskResult) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("result-tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

fn write_status(path: &Path, message: &str) {
    let line = format!("{} {message}\n", chrono::Utc::now().to_rfc3339());
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
}

/// Run one task to completion. Returns the process exit code.
pub async fn run(instruction_path: &Path) -> i32 {
    let instruction = match load_instruction(instruction_path) {
        Ok(i) => i,
        Err(e) => {
            // Without an instruction there is no result path to write to;
            // the supervisor's dead-pid recovery covers this case.
            error!(path = %instruction_path.display(), err = %e, "unreadable instruction");
            return 1;
        }
    };

    write_status(&instruction.status_path, "worker started");
    let result = execute_agent(&instruction).await;
    write_status(
        &instruction.status_path,
        if result.success { "agent finished" } else { "agent failed" },
    );

    let exit_code = result.exit_code;
    if let Err(e) = write_result(&instruction.result_path, &result) {
        error!(task_id = %instruction.task_id, err = %e, "failed to write result artifact");
        return 1;
    }
    info!(task_id = %instruction.task_id, exit_code, "worker done");
    // Signal deaths and spawn failures surface as exit 1.
    if (0..=255).contains(&exit_code) {
        exit_code
    } else {
        1
    }
}

fn load_instruction(path: &Path) -> anyhow::Result<WorkerInstruction> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Spawn the AI CLI and capture its output. Never fails: every outcome
/// becomes a [`TaskResult`].
async fn execute_agent(instruction: &WorkerInstruction) -> TaskResult {
    let Some((program, leading)) = instruction.agent_command.split_first() else {
        return TaskResult {
            task_id: instruction.task_id.clone(),
            exit_code: -1,
            success: false,
            output: String::new(),
            error: "empty agent command".to_owned(),
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(leading)
        .arg("--print")
        .arg("--dangerously-skip-permissions")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            return TaskResult {
                task_id: instruction.task_id.clone(),
                exit_code: -1,
                success: false,
                output: String::new(),
                error: format!("failed to spawn agent: {e}"),
                completed_at: chrono::Utc::now().to_rfc3339(),
            };
        }
    };

    // Pipe the instruction JSON on stdin, then close it so the agent sees
    // EOF.
    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::json!({
            "task_id": instruction.task_id,
            "issue_id": instruction.issue_id,
            "prompt": instruction.prompt,
        })
        .to_string();
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            error!(task_id = %instruction.task_id, err = %e, "stdin write failed");
        }
    }

    match child.wait_with_output().await {
        Ok(output) => {
            let exit_code = output.status.code().unwrap_or(-1);
            TaskResult {
                task_id: instruction.task_id.clone(),
                exit_code,
                success: output.status.success(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
                error: String::from_utf8_lossy(&output.stderr).into_owned(),
                completed_at: chrono::Utc::now().to_rfc3339(),
            }
        }
        Err(e) => TaskResult {
            task_id: instruction.task_id.clone(),
            exit_code: -1,
            success: false,
            output: String::new(),
            error: format!("failed to collect agent output: {e}"),
            completed_at: chrono::Utc::now().to_rfc3339(),
        },
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
