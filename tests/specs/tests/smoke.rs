// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Smoke tests that run the compiled `poppo` binary: CLI surface, fatal
//! init errors, and the worker-mode entry point.

use std::process::Command;

use poppo::worker::{TaskResult, WorkerInstruction};
use poppo_specs::poppo_binary;

fn binary_available() -> bool {
    poppo_binary().exists()
}

#[test]
fn version_flag_prints_and_exits_zero() -> anyhow::Result<()> {
    if !binary_available() {
        return Ok(());
    }
    let output = Command::new(poppo_binary()).arg("--version").output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("poppo"), "unexpected version output: {stdout}");
    Ok(())
}

#[test]
fn help_flag_mentions_required_env() -> anyhow::Result<()> {
    if !binary_available() {
        return Ok(());
    }
    let output = Command::new(poppo_binary()).arg("--help").output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FORGE_TOKEN"));
    assert!(stdout.contains("--base-dir"));
    Ok(())
}

#[test]
fn missing_token_is_a_fatal_init_error() -> anyhow::Result<()> {
    if !binary_available() {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let output = Command::new(poppo_binary())
        .arg("--base-dir")
        .arg(dir.path())
        .env_remove("FORGE_TOKEN")
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("FORGE_TOKEN"), "unexpected stderr: {stderr}");
    Ok(())
}

#[test]
fn worker_mode_runs_agent_and_writes_result() -> anyhow::Result<()> {
    if !binary_available() {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;

    // Stand-in agent: drain stdin, emit a line.
    let agent = dir.path().join("agent.sh");
    std::fs::write(&agent, "#!/bin/sh\ncat >/dev/null\necho smoke-done\n")?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755))?;
    }

    let result_path = dir.path().join("task-issue-9.result");
    let instruction = WorkerInstruction {
        task_id: "issue-9".to_owned(),
        issue_id: 9,
        prompt: "fix the thing".to_owned(),
        agent_command: vec![agent.to_string_lossy().into_owned()],
        result_path: result_path.clone(),
        status_path: dir.path().join("task-issue-9.status"),
    };
    let instruction_path = dir.path().join("instruction-issue-9.json");
    std::fs::write(&instruction_path, serde_json::to_string(&instruction)?)?;

    let output = Command::new(poppo_binary())
        .args(["worker", "--instruction"])
        .arg(&instruction_path)
        .output()?;
    assert!(output.status.success(), "worker exited nonzero: {output:?}");

    let result: TaskResult = serde_json::from_str(&std::fs::read_to_string(&result_path)?)?;
    assert!(result.success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output.trim(), "smoke-done");
    assert!(chrono::DateTime::parse_from_rfc3339(&result.completed_at).is_ok());
    Ok(())
}

#[test]
fn worker_mode_with_missing_instruction_fails() -> anyhow::Result<()> {
    if !binary_available() {
        return Ok(());
    }
    let output = Command::new(poppo_binary())
        .args(["worker", "--instruction", "/nonexistent/instruction.json"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    Ok(())
}
