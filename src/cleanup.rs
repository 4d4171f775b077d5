//! Deterministic teardown of task process trees.
//!
//! Every task subprocess is spawned as the leader of a fresh process group,
//! so one signal reaches the assistant and all of its spawned tool servers.
//! The sweep pass catches tools that detached from the group and outlived
//! their parent.
use std::{collections::HashMap, thread, time::Instant};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_json::json;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::{
    constants::{
        CLEANUP_GRACE, CLEANUP_POLL, DEFAULT_ORPHAN_PATTERNS, ORPHAN_PATTERNS_ENV,
    },
    logs::{EventKind, ExecutionLog, LogEvent},
};

/// Resolves the orphan sweep allow-list from the environment or defaults.
pub fn orphan_patterns() -> Vec<String> {
    match std::env::var(ORPHAN_PATTERNS_ENV) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => DEFAULT_ORPHAN_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn signal_group(pgid: u32, sig: Signal) -> bool {
    match signal::killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            debug!("Process group {pgid} already gone");
            false
        }
        Err(err) => {
            warn!("Failed to signal process group {pgid}: {err}");
            false
        }
    }
}

fn group_alive(pgid: u32) -> bool {
    match signal::killpg(Pid::from_raw(pgid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn log_signal(log: &ExecutionLog, task: Option<&str>, id: Option<u64>, target: &str, sig: &str) {
    if let Err(err) = log.append(&LogEvent::new(
        EventKind::CleanupSignal,
        task,
        id,
        json!({ "target": target, "signal": sig }),
    )) {
        warn!("Failed to log cleanup_signal: {err}");
    }
}

/// Terminates the task's process group: SIGTERM, a short grace window, then
/// SIGKILL for survivors. Safe to call repeatedly; signalling an already
/// empty group is tolerated.
pub fn terminate_group(pgid: u32, log: &ExecutionLog, task: Option<&str>, id: Option<u64>) {
    if !group_alive(pgid) {
        debug!("Cleanup for group {pgid}: nothing alive");
        return;
    }

    signal_group(pgid, Signal::SIGTERM);
    log_signal(log, task, id, &format!("pgid:{pgid}"), "SIGTERM");

    let deadline = Instant::now() + CLEANUP_GRACE;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return;
        }
        thread::sleep(CLEANUP_POLL);
    }

    if group_alive(pgid) {
        signal_group(pgid, Signal::SIGKILL);
        log_signal(log, task, id, &format!("pgid:{pgid}"), "SIGKILL");
    }
}

/// Terminates individually recorded pids, for crash recovery when the group
/// leader is long gone but `running.child_pids` survived in the state file.
pub fn kill_recorded_pids(pids: &[u32], log: &ExecutionLog, task: Option<&str>, id: Option<u64>) {
    for &pid in pids {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => log_signal(log, task, id, &format!("pid:{pid}"), "SIGTERM"),
            Err(Errno::ESRCH) => debug!("Recorded pid {pid} already gone"),
            Err(err) => warn!("Failed to signal recorded pid {pid}: {err}"),
        }
    }
}

/// Returns the pids of the leader and every live descendant, found by
/// walking parent links in the process table.
pub fn sample_group_pids(leader: u32, system: &mut System) -> Vec<u32> {
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children_of
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut pids = Vec::new();
    let mut frontier = vec![leader];
    while let Some(pid) = frontier.pop() {
        if system.process(sysinfo::Pid::from_u32(pid)).is_some() {
            pids.push(pid);
        }
        if let Some(children) = children_of.get(&pid) {
            frontier.extend(children.iter().copied());
        }
    }

    pids.sort_unstable();
    pids
}

/// Walks the process table and terminates assistant tool processes whose
/// parent is no longer alive. Matching is by allow-listed substrings over
/// the process name and argv. Best-effort; returns the pids signalled.
pub fn orphan_sweep(
    patterns: &[String],
    system: &mut System,
    log: &ExecutionLog,
    task: Option<&str>,
    id: Option<u64>,
) -> Vec<u32> {
    system.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = std::process::id();
    let mut swept = Vec::new();

    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if pid == own_pid {
            continue;
        }

        let orphaned = match process.parent() {
            None => true,
            Some(parent) => {
                parent.as_u32() == 1 || system.process(parent).is_none()
            }
        };
        if !orphaned {
            continue;
        }

        let name = process.name().to_string_lossy().to_lowercase();
        let argv = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let matched = patterns
            .iter()
            .any(|p| {
                let p = p.to_lowercase();
                name.contains(&p) || argv.contains(&p)
            });
        if !matched {
            continue;
        }

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                log_signal(log, task, id, &format!("orphan:{pid}"), "SIGTERM");
                swept.push(pid);
            }
            Err(Errno::ESRCH) => debug!("Orphan {pid} exited before signal"),
            Err(err) => warn!("Failed to sweep orphan {pid}: {err}"),
        }
    }

    swept
}
