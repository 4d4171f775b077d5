//! Managed crontab section for scheduled tasks.
//!
//! Clodputer owns exactly one sentinel-delimited block in the user crontab.
//! Everything outside the sentinels is preserved byte-for-byte on install and
//! uninstall. The crontab is only ever touched through the host's `crontab`
//! binary, never through library-internal paths.
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    config::{TaskDefinition, Trigger},
    constants::{CRON_SENTINEL_BEGIN, CRON_SENTINEL_END},
    error::CronError,
    logs::{EventKind, ExecutionLog, LogEvent},
    runtime,
};

/// Pads a 5-field crontab expression with a seconds field for the `cron`
/// crate, which expects 6 or 7 fields.
pub fn normalize_expression(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    match parts.len() {
        5 => format!("0 {}", parts.join(" ")),
        _ => parts.join(" "),
    }
}

/// Converts an interval in seconds to an equivalent 5-field crontab
/// expression, when one exists.
pub fn interval_expression(seconds: u64) -> Option<String> {
    if seconds < 60 || seconds > 86_400 || seconds % 60 != 0 {
        return None;
    }
    let minutes = seconds / 60;
    if minutes <= 59 {
        return Some(format!("*/{minutes} * * * *"));
    }
    if minutes % 60 == 0 {
        let hours = minutes / 60;
        if hours <= 23 {
            return Some(format!("0 */{hours} * * *"));
        }
        if hours == 24 {
            return Some("0 0 * * *".to_string());
        }
    }
    None
}

fn resolve_timezone(timezone: Option<&str>, task: &str) -> Result<Tz, CronError> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(raw) => raw.parse::<Tz>().map_err(|_| CronError::InvalidTimezone {
            task: task.to_string(),
            timezone: raw.to_string(),
        }),
    }
}

/// One line of the managed block before rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    /// Task name, used as the `run` argument.
    pub task: String,
    /// 5-field crontab expression.
    pub expression: String,
    /// Timezone the expression is evaluated in.
    pub timezone: Tz,
}

/// Derives the schedule entries from the enabled tasks that carry a cron or
/// interval trigger.
pub fn scheduled_entries(tasks: &[TaskDefinition]) -> Result<Vec<ScheduledEntry>, CronError> {
    let mut entries = Vec::new();
    for task in tasks {
        if !task.enabled {
            continue;
        }
        match &task.trigger {
            Some(Trigger::Cron { expression, timezone }) => {
                let normalized = normalize_expression(expression);
                Schedule::from_str(&normalized).map_err(|err| CronError::InvalidExpression {
                    task: task.name.clone(),
                    expression: expression.clone(),
                    reason: err.to_string(),
                })?;
                entries.push(ScheduledEntry {
                    task: task.name.clone(),
                    expression: expression.split_whitespace().collect::<Vec<_>>().join(" "),
                    timezone: resolve_timezone(timezone.as_deref(), &task.name)?,
                });
            }
            Some(Trigger::Interval { seconds }) => {
                let expression = interval_expression(*seconds).ok_or(
                    CronError::UnsupportedInterval {
                        task: task.name.clone(),
                        seconds: *seconds,
                    },
                )?;
                entries.push(ScheduledEntry {
                    task: task.name.clone(),
                    expression,
                    timezone: chrono_tz::UTC,
                });
            }
            _ => {}
        }
    }
    Ok(entries)
}

/// Renders the managed block, sentinels included, one line per task. A
/// `CRON_TZ` assignment is emitted whenever the timezone changes between
/// consecutive entries so each expression is evaluated in its own zone.
pub fn render_block(entries: &[ScheduledEntry], clodputer_bin: &Path, cron_log: &Path) -> String {
    let mut block = String::new();
    block.push_str(CRON_SENTINEL_BEGIN);
    block.push('\n');

    let mut current_tz: Option<Tz> = None;
    for entry in entries {
        if current_tz != Some(entry.timezone) {
            block.push_str(&format!("CRON_TZ={}\n", entry.timezone.name()));
            current_tz = Some(entry.timezone);
        }
        block.push_str(&format!(
            "{} {} run {} >> {} 2>&1\n",
            entry.expression,
            clodputer_bin.display(),
            entry.task,
            cron_log.display(),
        ));
    }

    block.push_str(CRON_SENTINEL_END);
    block.push('\n');
    block
}

/// Splits a crontab text into (before, managed block, after). The block
/// spans the BEGIN line through the END line inclusive; `before` and `after`
/// are returned byte-for-byte.
pub fn split_managed(text: &str) -> (String, Option<String>, String) {
    let mut before = String::new();
    let mut block = String::new();
    let mut after = String::new();
    let mut state = 0; // 0 = before, 1 = inside, 2 = after

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        match state {
            0 if trimmed == CRON_SENTINEL_BEGIN => {
                state = 1;
                block.push_str(line);
            }
            0 => before.push_str(line),
            1 => {
                block.push_str(line);
                if trimmed == CRON_SENTINEL_END {
                    state = 2;
                }
            }
            _ => after.push_str(line),
        }
    }

    if state == 0 {
        (before, None, after)
    } else {
        (before, Some(block), after)
    }
}

/// Recomposes a crontab text with the managed block replaced (or removed
/// when `block` is `None`). Text outside the block is untouched.
pub fn apply_block(current: &str, block: Option<&str>) -> String {
    let (before, existing, after) = split_managed(current);
    let mut text = before;
    match block {
        Some(block) => {
            // Append after existing content, separated by a newline if the
            // preceding text does not already end with one.
            if existing.is_none() && !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(block);
        }
        None => {}
    }
    text.push_str(&after);
    text
}

/// Reads the current user crontab; an absent crontab reads as empty.
pub fn read_crontab() -> Result<String, CronError> {
    let output = Command::new("crontab").arg("-l").output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        // `crontab -l` exits non-zero when the user has no crontab yet.
        Ok(String::new())
    }
}

/// Installs a crontab text through `crontab -`.
pub fn write_crontab(text: &str) -> Result<(), CronError> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(CronError::InstallRejected(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Copies the pre-write crontab text into the backups directory with a
/// timestamped name, suffixed on collision.
pub fn backup_crontab(text: &str, backups_dir: &Path) -> Result<PathBuf, CronError> {
    fs::create_dir_all(backups_dir)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut path = backups_dir.join(format!("crontab-{stamp}.txt"));
    let mut suffix = 1;
    while path.exists() {
        path = backups_dir.join(format!("crontab-{stamp}-{suffix}.txt"));
        suffix += 1;
    }
    fs::write(&path, text)?;
    debug!("Crontab backed up to {:?}", path);
    Ok(path)
}

/// Result of an install or uninstall pass.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Rendered task lines in the new managed block (0 for uninstall).
    pub entries: usize,
    /// Whether the crontab text actually changed.
    pub changed: bool,
    /// The full crontab text after the operation.
    pub text: String,
}

/// Renders and installs the managed block for the given tasks. With
/// `dry_run` the new text is computed and reported but nothing is written.
pub fn install(
    tasks: &[TaskDefinition],
    log: &ExecutionLog,
    dry_run: bool,
) -> Result<InstallReport, CronError> {
    let entries = scheduled_entries(tasks)?;
    let bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("clodputer"));
    let block = render_block(&entries, &bin, &runtime::cron_log_path());

    let current = read_crontab()?;
    let text = apply_block(&current, Some(&block));
    let changed = text != current;

    if !dry_run {
        // The prior crontab is backed up on every install, changed or not.
        let backup = backup_crontab(&current, &runtime::backups_dir())?;
        write_crontab(&text)?;
        if let Err(err) = log.append(&LogEvent::new(
            EventKind::CronInstalled,
            None,
            None,
            json!({
                "action": "install",
                "entries": entries.len(),
                "backup": backup.display().to_string(),
            }),
        )) {
            tracing::warn!("Failed to log cron_installed: {err}");
        }
        info!("Installed {} scheduled task(s) into crontab", entries.len());
    }

    Ok(InstallReport {
        entries: entries.len(),
        changed,
        text,
    })
}

/// Removes the managed block, restoring the crontab to its pre-install
/// shape. Content outside the sentinels is untouched.
pub fn uninstall(log: &ExecutionLog, dry_run: bool) -> Result<InstallReport, CronError> {
    let current = read_crontab()?;
    let text = apply_block(&current, None);
    let changed = text != current;

    if !dry_run {
        let backup = backup_crontab(&current, &runtime::backups_dir())?;
        write_crontab(&text)?;
        if let Err(err) = log.append(&LogEvent::new(
            EventKind::CronInstalled,
            None,
            None,
            json!({
                "action": "uninstall",
                "backup": backup.display().to_string(),
            }),
        )) {
            tracing::warn!("Failed to log cron_installed: {err}");
        }
        info!("Removed managed crontab block");
    }

    Ok(InstallReport {
        entries: 0,
        changed,
        text,
    })
}

/// Computes the next `count` firing times of an expression in a timezone
/// without touching the crontab. Timezone rules are honored: local times
/// skipped by a DST transition never materialize, repeated times fire once.
pub fn preview(
    expression: &str,
    timezone: Option<&str>,
    task: &str,
    count: usize,
) -> Result<Vec<DateTime<Tz>>, CronError> {
    let tz = resolve_timezone(timezone, task)?;
    let normalized = normalize_expression(expression);
    let schedule = Schedule::from_str(&normalized).map_err(|err| CronError::InvalidExpression {
        task: task.to_string(),
        expression: expression.to_string(),
        reason: err.to_string(),
    })?;
    Ok(schedule.upcoming(tz).take(count).collect())
}

/// Read-only report on the installed block versus the current task set.
#[derive(Debug, Clone)]
pub struct CronReport {
    /// Whether a managed block exists in the crontab.
    pub block_present: bool,
    /// Number of lines inside the block, sentinels excluded.
    pub line_count: usize,
    /// Lines that differ between the installed block and what the current
    /// task set would render (`-` installed only, `+` rendered only).
    pub drift: Vec<String>,
}

/// Compares the installed managed block with what the current task set
/// would install.
pub fn diagnostics(tasks: &[TaskDefinition]) -> Result<CronReport, CronError> {
    let entries = scheduled_entries(tasks)?;
    let bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("clodputer"));
    let rendered = render_block(&entries, &bin, &runtime::cron_log_path());

    let current = read_crontab()?;
    let (_, block, _) = split_managed(&current);

    let installed_lines: Vec<&str> = block
        .as_deref()
        .map(inner_lines)
        .unwrap_or_default();
    let rendered_lines: Vec<&str> = inner_lines(&rendered);

    let mut drift = Vec::new();
    for line in &installed_lines {
        if !rendered_lines.contains(line) {
            drift.push(format!("- {line}"));
        }
    }
    for line in &rendered_lines {
        if !installed_lines.contains(line) {
            drift.push(format!("+ {line}"));
        }
    }

    Ok(CronReport {
        block_present: block.is_some(),
        line_count: installed_lines.len(),
        drift,
    })
}

fn inner_lines(block: &str) -> Vec<&str> {
    block
        .lines()
        .filter(|line| *line != CRON_SENTINEL_BEGIN && *line != CRON_SENTINEL_END)
        .filter(|line| !line.is_empty())
        .collect()
}
