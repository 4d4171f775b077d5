//! Task definition loading and validation.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::warn;

use crate::error::ConfigError;

/// Dispatch priority of a task. `High` items are inserted ahead of all
/// pending `Normal` items but behind earlier `High` items.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    /// Default priority.
    #[default]
    Normal,
    /// Jumps ahead of pending normal items; never preempts a running one.
    High,
}

/// Permission mode passed to the assistant CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionMode {
    /// Prompting behavior left to the assistant's defaults.
    #[default]
    Default,
    /// Plan-only mode; the assistant proposes without executing.
    Plan,
    /// File edits are pre-approved.
    AcceptEdits,
    /// All permission prompts are bypassed.
    BypassPermissions,
}

/// Filesystem event kind a watch trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WatchEventKind {
    /// A file appeared (including atomic rename into the directory).
    Created,
    /// A file's contents changed.
    Modified,
    /// A file disappeared.
    Deleted,
}

/// How a task gets scheduled. Absent means manual invocation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    /// Scheduled via the user crontab.
    Cron {
        /// Cron expression (5 or 6 fields).
        expression: String,
        /// IANA timezone name; defaults to UTC when absent.
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Fired by filesystem events in a single directory.
    Watch {
        /// Directory observed (no recursion).
        path: PathBuf,
        /// Glob applied to file names within the directory.
        pattern: String,
        /// Event kind that fires the trigger.
        event: WatchEventKind,
        /// Coalescing window for repeated events on one path.
        #[serde(default = "default_debounce_ms")]
        debounce_ms: u64,
    },
    /// Fixed interval, converted to a crontab entry at install time.
    Interval {
        /// Interval in seconds; must be a multiple of 60 in 60..=86400.
        seconds: u64,
    },
}

fn default_debounce_ms() -> u64 {
    1000
}

/// One entry of an `on_success`/`on_failure` handler list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandlerAction {
    /// Appends a placeholder-substituted line to the structured log.
    Log {
        /// Template, may reference `{{ context.KEY }}` etc.
        message: String,
    },
    /// Raises a desktop notification (best-effort).
    Notify {
        /// Whether the notification is actually sent.
        enabled: bool,
    },
}

/// The assistant invocation described by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Prompt text passed to the assistant on stdin after substitution.
    pub prompt: String,
    /// Tools the assistant may use.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the assistant must not use.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Permission mode forwarded to the CLI.
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Wall-clock budget in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Values available to the prompt as `{{ context.KEY }}`.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional MCP tool-config file forwarded via `--mcp-config`.
    #[serde(default)]
    pub mcp_config: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    600
}

/// A fully validated task definition as consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique, filename-safe identifier. The file stem wins over this field
    /// when loading from disk.
    #[serde(default)]
    pub name: String,
    /// Disabled tasks are never dispatched or installed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Optional schedule or watch trigger; absent means manual-only.
    #[serde(default)]
    pub trigger: Option<Trigger>,
    /// The assistant invocation itself.
    pub task: TaskSpec,
    /// Maximum retry attempts after a retriable failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Base for the exponential retry backoff, in seconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    /// Handlers run after a successful outcome.
    #[serde(default)]
    pub on_success: Vec<HandlerAction>,
    /// Handlers run after a failed outcome.
    #[serde(default)]
    pub on_failure: Vec<HandlerAction>,
}

fn default_enabled() -> bool {
    true
}

fn default_retry_backoff() -> u64 {
    30
}

fn name_is_filename_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl TaskDefinition {
    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !name_is_filename_safe(&self.name) {
            return Err(ConfigError::InvalidTask {
                task: self.name.clone(),
                reason: "name must be non-empty and filename-safe".into(),
            });
        }

        match &self.trigger {
            Some(Trigger::Cron { expression, timezone }) => {
                let normalized = crate::cron::normalize_expression(expression);
                if cron::Schedule::from_str(&normalized).is_err() {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: format!("invalid cron expression '{expression}'"),
                    });
                }
                if let Some(tz) = timezone
                    && tz.parse::<chrono_tz::Tz>().is_err()
                {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: format!("invalid timezone '{tz}'"),
                    });
                }
            }
            Some(Trigger::Interval { seconds }) => {
                let seconds = *seconds;
                if seconds < 60 || seconds > 86_400 || seconds % 60 != 0 {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: format!(
                            "interval {seconds}s must be a multiple of 60 in 60..=86400"
                        ),
                    });
                }
                if crate::cron::interval_expression(seconds).is_none() {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: format!(
                            "interval {seconds}s has no crontab equivalent"
                        ),
                    });
                }
            }
            Some(Trigger::Watch { pattern, debounce_ms, .. }) => {
                if glob::Pattern::new(pattern).is_err() {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: format!("invalid glob pattern '{pattern}'"),
                    });
                }
                if *debounce_ms == 0 {
                    return Err(ConfigError::InvalidTask {
                        task: self.name.clone(),
                        reason: "watch debounce must be non-zero".into(),
                    });
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Whether this task should appear in the installed crontab.
    pub fn is_scheduled(&self) -> bool {
        self.enabled
            && matches!(
                self.trigger,
                Some(Trigger::Cron { .. }) | Some(Trigger::Interval { .. })
            )
    }
}

/// Loads a single task definition by name from the tasks directory.
pub fn load_task(tasks_dir: &Path, name: &str) -> Result<TaskDefinition, ConfigError> {
    if !name_is_filename_safe(name) {
        return Err(ConfigError::UnknownTask(name.to_string()));
    }

    let path = tasks_dir.join(format!("{name}.yaml"));
    if !path.exists() {
        return Err(ConfigError::UnknownTask(name.to_string()));
    }

    let raw = fs::read_to_string(&path)?;
    let mut definition: TaskDefinition =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseError {
            path: path.clone(),
            source,
        })?;

    // The file stem is authoritative for the task name.
    definition.name = name.to_string();
    definition.validate()?;
    Ok(definition)
}

/// Loads every parseable task definition in the directory. Files that fail
/// to parse or validate are skipped with a warning so one bad file cannot
/// take down the engine.
pub fn load_tasks(tasks_dir: &Path) -> Result<Vec<TaskDefinition>, ConfigError> {
    let mut tasks = Vec::new();
    if !tasks_dir.exists() {
        return Ok(tasks);
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(tasks_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    entries.sort();

    for path in entries {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match load_task(tasks_dir, stem) {
            Ok(task) => tasks.push(task),
            Err(err) => warn!("Skipping task file {:?}: {err}", path),
        }
    }

    Ok(tasks)
}

/// Secrets loaded from `secrets.env`, substituted into prompts as
/// `{{ secrets.NAME }}`.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
}

impl Secrets {
    /// Loads `KEY=VALUE` lines, ignoring blanks and `#` comments. A missing
    /// file yields an empty map. A permissive file mode is warned about but
    /// tolerated.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            return Ok(Self::default());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    "Secrets file {:?} has mode {:o}; expected 0600",
                    path, mode
                );
            }
        }

        let raw = fs::read_to_string(path)?;
        let mut values = BTreeMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(Self { values })
    }

    /// Looks up a secret by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterates over all loaded secrets, for export into the subprocess
    /// environment.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}
