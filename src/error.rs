//! Error handling for clodputer.
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating task definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a task file or the tasks directory.
    #[error("Failed to read task definition: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML task definitions.
    #[error("Invalid YAML in task file '{path}': {source}")]
    ParseError {
        /// The file that failed to parse.
        path: PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A task definition failed semantic validation.
    #[error("Invalid task '{task}': {reason}")]
    InvalidTask {
        /// The offending task name.
        task: String,
        /// Why validation rejected it.
        reason: String,
    },

    /// A queue item referenced a task with no definition on disk.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// A queue item referenced a task that is disabled.
    #[error("Task '{0}' is disabled")]
    DisabledTask(String),
}

/// Errors raised by the persistent queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Error reading or writing the state file.
    #[error("Queue state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing queue state to JSON.
    #[error("Queue state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Another engine instance holds the lockfile.
    #[error("Another engine is already running (pid {pid})")]
    LockHeld {
        /// Pid recorded in the live lockfile.
        pid: u32,
    },
}

/// Errors raised while running the assistant subprocess.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error spawning the assistant process.
    #[error("Failed to start task '{task}': {source}")]
    SpawnError {
        /// The task whose subprocess failed to start.
        task: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Error on the subprocess I/O channels.
    #[error("Subprocess I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the crontab manager.
#[derive(Debug, Error)]
pub enum CronError {
    /// The `crontab` binary could not be invoked.
    #[error("Failed to run crontab: {0}")]
    CrontabUnavailable(#[from] std::io::Error),

    /// `crontab` rejected the rendered table.
    #[error("crontab install failed: {0}")]
    InstallRejected(String),

    /// A schedule expression failed to parse.
    #[error("Invalid cron expression '{expression}' for task '{task}': {reason}")]
    InvalidExpression {
        /// The task carrying the expression.
        task: String,
        /// The raw expression.
        expression: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// A schedule timezone failed to resolve.
    #[error("Invalid timezone '{timezone}' for task '{task}'")]
    InvalidTimezone {
        /// The task carrying the timezone.
        task: String,
        /// The unresolvable name.
        timezone: String,
    },

    /// An interval trigger cannot be expressed as a crontab entry.
    #[error("Interval of {seconds}s for task '{task}' cannot be expressed as cron")]
    UnsupportedInterval {
        /// The task carrying the interval.
        task: String,
        /// The rejected interval.
        seconds: u64,
    },
}

/// Errors raised by the file-watch service.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Error on the watcher pidfile or log file.
    #[error("Watcher I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The OS notification backend failed.
    #[error("Filesystem notification error: {0}")]
    Notify(#[from] notify::Error),

    /// A watcher daemon is already running.
    #[error("Watcher already running (pid {pid})")]
    AlreadyRunning {
        /// Pid recorded in the live pidfile.
        pid: u32,
    },

    /// No watcher daemon is running.
    #[error("Watcher is not running")]
    NotRunning,

    /// No enabled task defines a watch trigger.
    #[error("No watch triggers are configured")]
    NoTriggers,
}

/// Errors raised by the structured log sink.
#[derive(Debug, Error)]
pub enum LogError {
    /// Error appending to or reading the log file.
    #[error("Execution log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding an event as JSON.
    #[error("Execution log encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level engine error aggregating all subsystems.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Task definition error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Executor error.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Cron manager error.
    #[error(transparent)]
    Cron(#[from] CronError),

    /// Watcher error.
    #[error(transparent)]
    Watcher(#[from] WatcherError),

    /// Structured log error.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The engine was interrupted by SIGINT/SIGTERM.
    #[error("Interrupted")]
    Interrupted,
}

impl EngineError {
    /// Maps the error onto the process exit codes of the CLI contract:
    /// 1 for validation/configuration problems, 130 for interruption,
    /// 2 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Cron(CronError::InvalidExpression { .. })
            | EngineError::Cron(CronError::InvalidTimezone { .. })
            | EngineError::Cron(CronError::UnsupportedInterval { .. }) => 1,
            EngineError::Queue(QueueError::LockHeld { .. }) => 2,
            EngineError::Interrupted => 130,
            _ => 2,
        }
    }
}
