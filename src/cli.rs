//! Command-line interface for clodputer.
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

use crate::config::Priority;
use crate::constants::{LOG_TAIL_DEFAULT, SCHEDULE_PREVIEW_DEFAULT};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Priority argument accepted by `run`.
#[derive(Clone, Copy, Debug)]
pub struct PriorityArg(pub Priority);

impl FromStr for PriorityArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(PriorityArg(Priority::Normal)),
            "high" => Ok(PriorityArg(Priority::High)),
            other => Err(format!("invalid priority '{other}' (expected normal|high)")),
        }
    }
}

/// Command-line interface for clodputer.
#[derive(Parser)]
#[command(name = "clodputer", version, author)]
#[command(about = "Local automation agent for Claude CLI tasks", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for clodputer.
#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a task and drain the queue.
    Run {
        /// Name of the task definition under `~/.clodputer/tasks/`.
        task: String,

        /// Override the task's configured priority.
        #[arg(long, value_name = "PRIORITY")]
        priority: Option<PriorityArg>,

        /// Only enqueue; leave execution to an already-running engine.
        #[arg(long)]
        enqueue_only: bool,
    },

    /// Show the queue, or clear its pending items.
    Queue {
        /// Drop all pending items (the running item is untouched).
        #[arg(long)]
        clear: bool,
    },

    /// Show engine, watcher, and queue status.
    Status {
        /// Emit machine-readable JSON instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Show the structured execution log.
    Logs {
        /// Number of events to show.
        #[arg(long, value_name = "N", default_value_t = LOG_TAIL_DEFAULT)]
        tail: usize,

        /// Keep following the log for new events.
        #[arg(long)]
        follow: bool,

        /// Only show events for the named task.
        #[arg(long, value_name = "TASK")]
        task: Option<String>,

        /// Emit raw JSON lines instead of a rendered view.
        #[arg(long)]
        json: bool,
    },

    /// Install the managed crontab block for scheduled tasks.
    Install {
        /// Compute and print the changes without writing the crontab.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove the managed crontab block.
    Uninstall {
        /// Compute and print the changes without writing the crontab.
        #[arg(long)]
        dry_run: bool,
    },

    /// Preview the next firing times of a scheduled task.
    SchedulePreview {
        /// Name of the task definition.
        task: String,

        /// Number of firings to show.
        #[arg(long, value_name = "N", default_value_t = SCHEDULE_PREVIEW_DEFAULT)]
        count: usize,
    },

    /// Run or control the file-watch service.
    Watch {
        /// Detach as a daemon.
        #[arg(long, conflicts_with_all = ["stop", "status"])]
        daemon: bool,

        /// Stop the running watcher daemon.
        #[arg(long, conflicts_with = "status")]
        stop: bool,

        /// Report whether the watcher daemon is running.
        #[arg(long)]
        status: bool,
    },

    /// Run health diagnostics over queue, lock, watcher, and crontab state.
    Doctor,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
