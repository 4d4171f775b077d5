//! Status reporting and `doctor` diagnostics.
use std::{fs, path::Path};

use serde::Serialize;

use crate::{
    config::{TaskDefinition, Trigger},
    constants::{CLAUDE_BIN_ENV, DEFAULT_CLAUDE_BIN},
    cron,
    error::EngineError,
    logs::ExecutionLog,
    queue::{CompletedOutcome, EngineLock, OutcomeStatus, Queue, QueueItem},
    runtime, watcher,
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Point-in-time view of the whole system for the `status` command.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    /// Pid in the engine lockfile, if one exists.
    pub engine_pid: Option<u32>,
    /// Whether that lockfile is stale (recorded pid is dead).
    pub engine_lock_stale: bool,
    /// Pid of the live watcher daemon, if any.
    pub watcher_pid: Option<u32>,
    /// Number of pending queue items.
    pub pending: usize,
    /// The running item, if any.
    pub running: Option<QueueItem>,
    /// Recent outcomes, oldest first.
    pub completed_recent: Vec<CompletedOutcome>,
}

/// Collects the status snapshot from disk.
pub fn collect(queue: &Queue) -> Result<StatusSnapshot, EngineError> {
    let state = queue.snapshot()?;
    let lock_path = runtime::engine_lock_path();

    Ok(StatusSnapshot {
        engine_pid: EngineLock::read_holder(&lock_path),
        engine_lock_stale: EngineLock::is_stale(&lock_path),
        watcher_pid: watcher::daemon_status(),
        pending: state.pending.len(),
        running: state.running,
        completed_recent: state.completed_recent.into_iter().collect(),
    })
}

/// Renders the snapshot as a short human-readable report.
pub fn render_human(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();

    match (snapshot.engine_pid, snapshot.engine_lock_stale) {
        (Some(pid), false) => {
            out.push_str(&format!("engine:   {GREEN_BOLD}running{RESET} (pid {pid})\n"))
        }
        (Some(pid), true) => out.push_str(&format!(
            "engine:   {YELLOW_BOLD}stale lock{RESET} (dead pid {pid})\n"
        )),
        (None, _) => out.push_str("engine:   idle\n"),
    }

    match snapshot.watcher_pid {
        Some(pid) => {
            out.push_str(&format!("watcher:  {GREEN_BOLD}running{RESET} (pid {pid})\n"))
        }
        None => out.push_str("watcher:  stopped\n"),
    }

    match &snapshot.running {
        Some(item) => out.push_str(&format!(
            "running:  '{}' (item {}, attempt {})\n",
            item.task_name, item.id, item.attempt
        )),
        None => out.push_str("running:  none\n"),
    }
    out.push_str(&format!("pending:  {}\n", snapshot.pending));

    if !snapshot.completed_recent.is_empty() {
        out.push_str("recent:\n");
        for outcome in snapshot.completed_recent.iter().rev().take(5) {
            let color = match outcome.status {
                OutcomeStatus::Success => GREEN_BOLD,
                OutcomeStatus::Cancelled => YELLOW_BOLD,
                _ => RED_BOLD,
            };
            let error = outcome
                .error
                .as_deref()
                .map(|kind| format!(" ({kind})"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  #{} {} {color}{}{RESET}{error} in {:.1}s\n",
                outcome.id, outcome.task_name, outcome.status, outcome.duration_secs
            ));
        }
    }

    out
}

/// One `doctor` check result.
#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    /// Short check name.
    pub name: String,
    /// Whether the check passed.
    pub ok: bool,
    /// Human-readable detail.
    pub detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        ok,
        detail: detail.into(),
    }
}

fn claude_bin_resolvable() -> (bool, String) {
    match std::env::var(CLAUDE_BIN_ENV) {
        Ok(path) => {
            let exists = Path::new(&path).exists();
            (exists, format!("{CLAUDE_BIN_ENV}={path}"))
        }
        Err(_) => {
            let found = std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths)
                    .any(|dir| dir.join(DEFAULT_CLAUDE_BIN).is_file())
            });
            (found, format!("'{DEFAULT_CLAUDE_BIN}' on PATH"))
        }
    }
}

/// Runs every diagnostic and returns the individual results. The caller
/// maps an overall failure to exit code 3.
pub fn doctor(tasks: &[TaskDefinition], log: &ExecutionLog) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    // State file parses as-is. The doctor reports corruption without
    // triggering the archive-and-reset path.
    let queue_path = runtime::queue_path();
    let state_ok = match fs::read_to_string(&queue_path) {
        Ok(raw) => serde_json::from_str::<crate::queue::QueueState>(&raw).is_ok(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(_) => false,
    };
    checks.push(check(
        "queue_state",
        state_ok,
        if state_ok { "parses" } else { "unreadable or corrupt" },
    ));

    let lock_path = runtime::engine_lock_path();
    let stale = EngineLock::is_stale(&lock_path);
    checks.push(check(
        "engine_lock",
        !stale,
        if stale {
            "stale lockfile (holder is dead)"
        } else {
            "clean"
        },
    ));

    let corrupt_archives = fs::read_dir(runtime::backups_dir())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_string_lossy()
                        .starts_with("queue.corrupt-")
                })
                .count()
        })
        .unwrap_or(0);
    checks.push(check(
        "corrupt_archives",
        corrupt_archives == 0,
        format!("{corrupt_archives} archived corrupt queue file(s)"),
    ));

    // Informational: a stale watcher pidfile is cleaned up by the status
    // probe itself, so this can only report running or stopped.
    checks.push(check(
        "watcher",
        true,
        match watcher::daemon_status() {
            Some(pid) => format!("running (pid {pid})"),
            None => "stopped".to_string(),
        },
    ));

    for task in tasks {
        if let Some(Trigger::Watch { path, .. }) = &task.trigger
            && task.enabled
        {
            let exists = path.is_dir();
            checks.push(check(
                &format!("watch_path:{}", task.name),
                exists,
                format!("{}", path.display()),
            ));
        }
    }

    match cron::diagnostics(tasks) {
        Ok(report) => {
            let detail = if report.drift.is_empty() {
                format!(
                    "block {} with {} line(s), no drift",
                    if report.block_present { "present" } else { "absent" },
                    report.line_count
                )
            } else {
                format!("drift: {}", report.drift.join("; "))
            };
            let scheduled = tasks.iter().any(TaskDefinition::is_scheduled);
            // An absent block only matters when schedules exist.
            let ok = report.drift.is_empty() && (report.block_present || !scheduled);
            checks.push(check("cron_block", ok, detail));
        }
        Err(err) => checks.push(check("cron_block", false, err.to_string())),
    }

    let (bin_ok, bin_detail) = claude_bin_resolvable();
    checks.push(check("claude_bin", bin_ok, bin_detail));

    // Recent failures are informational; they never fail the doctor.
    let failures = log
        .tail(50, None)
        .map(|events| {
            events
                .iter()
                .filter(|event| {
                    matches!(
                        event.event,
                        crate::logs::EventKind::TaskFailed
                            | crate::logs::EventKind::TaskTimeout
                    )
                })
                .count()
        })
        .unwrap_or(0);
    checks.push(check(
        "recent_failures",
        true,
        format!("{failures} failure(s) in the last 50 events"),
    ));

    checks
}

/// Whether every check passed.
pub fn doctor_ok(checks: &[DoctorCheck]) -> bool {
    checks.iter().all(|check| check.ok)
}

/// Renders doctor results for the terminal.
pub fn render_doctor(checks: &[DoctorCheck]) -> String {
    let mut out = String::new();
    for check in checks {
        let mark = if check.ok {
            format!("{GREEN_BOLD}ok{RESET}")
        } else {
            format!("{RED_BOLD}fail{RESET}")
        };
        out.push_str(&format!("{:<24} {mark}  {}\n", check.name, check.detail));
    }
    out
}
