// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-level helpers shared by the store, lock service, and supervisor.

use nix::sys::signal;
use nix::unistd::Pid;

/// Checks whether a process with the given PID is alive on this host.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// Send SIGTERM to a pid. Returns `false` if the signal could not be
/// delivered (process already gone, or not ours).
pub fn terminate(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid_i32), signal::Signal::SIGTERM).is_ok()
}

/// This host's name, used in lock owner records. Falls back to
/// `"unknown"` when the hostname cannot be read.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
