//! Constants and default values for the clodputer engine.
//!
//! This module centralizes file names, sentinel strings, and timing values
//! used throughout the engine.

use std::time::Duration;

/// Current on-disk queue state format version.
pub const QUEUE_STATE_VERSION: u32 = 1;

/// Maximum number of recent outcomes kept in the completed ring.
pub const COMPLETED_RING_CAPACITY: usize = 20;

/// Directory under `$HOME` holding all clodputer state.
pub const STATE_DIR_NAME: &str = ".clodputer";

/// Subdirectory of the state dir holding task definitions.
pub const TASKS_DIR_NAME: &str = "tasks";

/// Subdirectory of the state dir holding crontab backups and corrupt
/// queue archives.
pub const BACKUPS_DIR_NAME: &str = "backups";

/// Queue state file name.
pub const QUEUE_FILE_NAME: &str = "queue.json";

/// Advisory lock anchor serializing queue read-modify-write cycles.
///
/// The queue file itself is replaced by rename on every persist, so a lock
/// taken on its inode would not serialize against a concurrent writer.
pub const QUEUE_GUARD_FILE_NAME: &str = "queue.json.lock";

/// Engine lockfile name; contains the pid of the running engine.
pub const ENGINE_LOCK_FILE_NAME: &str = "clodputer.lock";

/// Structured execution log file name.
pub const EXECUTION_LOG_FILE_NAME: &str = "execution.log";

/// Free-form cron subprocess output log.
pub const CRON_LOG_FILE_NAME: &str = "cron.log";

/// Free-form watcher daemon output log.
pub const WATCHER_LOG_FILE_NAME: &str = "watcher.log";

/// Watcher daemon pidfile name.
pub const WATCHER_PID_FILE_NAME: &str = "watcher.pid";

/// Optional `KEY=VALUE` secrets file name.
pub const SECRETS_FILE_NAME: &str = "secrets.env";

/// Sentinel opening the managed crontab block.
pub const CRON_SENTINEL_BEGIN: &str = "# CLODPUTER_BEGIN";

/// Sentinel closing the managed crontab block.
pub const CRON_SENTINEL_END: &str = "# CLODPUTER_END";

/// Environment variable naming the external assistant binary.
pub const CLAUDE_BIN_ENV: &str = "CLODPUTER_CLAUDE_BIN";

/// Environment variable with extra argv appended to the assistant command.
pub const EXTRA_ARGS_ENV: &str = "CLODPUTER_EXTRA_ARGS";

/// Environment variable overriding the orphan sweep allow-list
/// (comma-separated name/argv substrings).
pub const ORPHAN_PATTERNS_ENV: &str = "CLODPUTER_ORPHAN_PATTERNS";

/// Environment variable overriding the CPU dispatch gate (percent).
pub const MAX_CPU_ENV: &str = "CLODPUTER_MAX_CPU_PERCENT";

/// Environment variable overriding the memory dispatch gate (percent).
pub const MAX_MEMORY_ENV: &str = "CLODPUTER_MAX_MEMORY_PERCENT";

/// Default assistant binary when `CLODPUTER_CLAUDE_BIN` is unset.
pub const DEFAULT_CLAUDE_BIN: &str = "claude";

/// Default orphan sweep allow-list applied to process names and argv.
pub const DEFAULT_ORPHAN_PATTERNS: &[&str] = &["mcp", "claude"];

/// Default CPU utilization ceiling (percent) for the dispatch gate.
pub const DEFAULT_MAX_CPU_PERCENT: f32 = 85.0;

/// Default memory utilization ceiling (percent) for the dispatch gate.
pub const DEFAULT_MAX_MEMORY_PERCENT: f32 = 90.0;

/// Delay before the dispatch gate re-checks host load.
pub const RESOURCE_GATE_RECHECK: Duration = Duration::from_secs(5);

/// Grace window between SIGTERM and SIGKILL on a task's process group.
pub const CLEANUP_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a signalled group to exit.
pub const CLEANUP_POLL: Duration = Duration::from_millis(100);

/// Grace window when stopping the watcher daemon.
pub const WATCHER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Interval between child-pid samples while a task runs.
pub const PID_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum raw stdout retained when the assistant output fails to parse.
pub const RAW_OUTPUT_CAP: usize = 64 * 1024;

/// Ceiling for the watcher's re-establish backoff.
pub const WATCHER_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Initial watcher re-establish backoff.
pub const WATCHER_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Poll interval for `logs --follow`.
pub const LOG_FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Default number of lines shown by `logs --tail`.
pub const LOG_TAIL_DEFAULT: usize = 10;

/// Default number of firings shown by `schedule-preview`.
pub const SCHEDULE_PREVIEW_DEFAULT: usize = 5;
