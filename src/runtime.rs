//! Helpers for resolving the on-disk layout under `~/.clodputer`.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

use crate::constants::{
    BACKUPS_DIR_NAME, CRON_LOG_FILE_NAME, ENGINE_LOCK_FILE_NAME,
    EXECUTION_LOG_FILE_NAME, QUEUE_FILE_NAME, QUEUE_GUARD_FILE_NAME,
    SECRETS_FILE_NAME, STATE_DIR_NAME, TASKS_DIR_NAME, WATCHER_LOG_FILE_NAME,
    WATCHER_PID_FILE_NAME,
};

#[derive(Debug, Clone)]
struct RuntimeContext {
    state_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_home(home_dir())))
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

impl RuntimeContext {
    fn from_home(home: PathBuf) -> Self {
        Self {
            state_dir: home.join(STATE_DIR_NAME),
        }
    }
}

/// Re-resolves the state directory from the current environment. Subsequent
/// calls overwrite the active context, allowing forked helpers (watcher
/// daemon, cron-spawned runs) to operate with the correct paths.
pub fn init() {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_home(home_dir());
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_home(home.to_path_buf());
}

/// Returns the root directory for all clodputer state.
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Returns the directory scanned for task definition files.
pub fn tasks_dir() -> PathBuf {
    state_dir().join(TASKS_DIR_NAME)
}

/// Returns the canonical queue state file path.
pub fn queue_path() -> PathBuf {
    state_dir().join(QUEUE_FILE_NAME)
}

/// Returns the advisory lock anchor guarding queue read-modify-write cycles.
pub fn queue_guard_path() -> PathBuf {
    state_dir().join(QUEUE_GUARD_FILE_NAME)
}

/// Returns the engine lockfile path.
pub fn engine_lock_path() -> PathBuf {
    state_dir().join(ENGINE_LOCK_FILE_NAME)
}

/// Returns the structured execution log path.
pub fn execution_log_path() -> PathBuf {
    state_dir().join(EXECUTION_LOG_FILE_NAME)
}

/// Returns the free-form cron output log path.
pub fn cron_log_path() -> PathBuf {
    state_dir().join(CRON_LOG_FILE_NAME)
}

/// Returns the free-form watcher output log path.
pub fn watcher_log_path() -> PathBuf {
    state_dir().join(WATCHER_LOG_FILE_NAME)
}

/// Returns the directory holding crontab backups and corrupt queue archives.
pub fn backups_dir() -> PathBuf {
    state_dir().join(BACKUPS_DIR_NAME)
}

/// Returns the watcher daemon pidfile path.
pub fn watcher_pid_path() -> PathBuf {
    state_dir().join(WATCHER_PID_FILE_NAME)
}

/// Returns the optional secrets file path.
pub fn secrets_path() -> PathBuf {
    state_dir().join(SECRETS_FILE_NAME)
}
