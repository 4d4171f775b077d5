//! Persistent FIFO-with-priority task queue.
//!
//! The queue is a single JSON state file mutated only through full-state
//! atomic rewrites (write temp sibling, rename over canonical path). A
//! short-held advisory lock on a stable sibling serializes read-modify-write
//! cycles between the engine and the watcher; a separate pid lockfile
//! guarantees a single engine writer.
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::{sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::Display;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::{
    config::Priority,
    constants::{
        COMPLETED_RING_CAPACITY, DEFAULT_MAX_CPU_PERCENT, DEFAULT_MAX_MEMORY_PERCENT,
        MAX_CPU_ENV, MAX_MEMORY_ENV, QUEUE_STATE_VERSION,
    },
    error::QueueError,
    logs::{EventKind, ExecutionLog, LogEvent},
};

/// Which trigger produced a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemSource {
    /// Enqueued by a CLI invocation.
    Manual,
    /// Enqueued by a crontab entry.
    Cron,
    /// Enqueued by the file watcher.
    Watch,
}

/// Terminal status of a completed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeStatus {
    /// The assistant reported success.
    Success,
    /// The assistant failed (exit, parse, reported, or config error).
    Failure,
    /// The subprocess exceeded its wall-clock budget.
    Timeout,
    /// The engine was interrupted while the item ran.
    Cancelled,
}

/// One scheduled execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonically unique id within the lifetime of the queue file.
    pub id: u64,
    /// Name of the task definition to execute.
    pub task_name: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// When the item was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Retry attempt counter; 0 for the first run.
    #[serde(default)]
    pub attempt: u32,
    /// Which trigger produced the item.
    pub source: ItemSource,
    /// Trigger-specific payload (e.g. the path that fired the watcher).
    #[serde(default)]
    pub trigger_payload: Option<Value>,
    /// Earliest dispatch time for retry copies; absent means immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Populated while the item occupies the running slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Sampled pids of the subprocess tree; populated while running so crash
    /// recovery can finish cleanup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_pids: Vec<u32>,
}

/// Bounded record of a finished item kept in the completed ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOutcome {
    /// Id of the finished item.
    pub id: u64,
    /// Task name, for status display.
    pub task_name: String,
    /// Terminal status.
    pub status: OutcomeStatus,
    /// Wall-clock duration in seconds.
    pub duration_secs: f64,
    /// Error kind (`config`, `exit`, `parse`, `reported`, `timeout`,
    /// `cancelled`) when the item did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the item finished.
    pub completed_at: DateTime<Utc>,
}

/// The serialized queue root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    /// On-disk format tag; unknown versions are treated as corrupt.
    pub version: u32,
    /// Ordered pending items: priority desc, enqueue time asc.
    pub pending: Vec<QueueItem>,
    /// The single running item, if any.
    pub running: Option<QueueItem>,
    /// Bounded ring of recent outcomes, oldest first.
    pub completed_recent: VecDeque<CompletedOutcome>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            version: QUEUE_STATE_VERSION,
            pending: Vec::new(),
            running: None,
            completed_recent: VecDeque::with_capacity(COMPLETED_RING_CAPACITY),
        }
    }
}

impl QueueState {
    fn max_visible_id(&self) -> u64 {
        self.pending
            .iter()
            .map(|item| item.id)
            .chain(self.running.iter().map(|item| item.id))
            .chain(self.completed_recent.iter().map(|outcome| outcome.id))
            .max()
            .unwrap_or(0)
    }

    fn push_outcome(&mut self, outcome: CompletedOutcome) {
        if self.completed_recent.len() >= COMPLETED_RING_CAPACITY {
            self.completed_recent.pop_front();
        }
        self.completed_recent.push_back(outcome);
    }
}

/// Handle on the persistent queue.
#[derive(Debug, Clone)]
pub struct Queue {
    path: PathBuf,
    guard_path: PathBuf,
    backups_dir: PathBuf,
    log: ExecutionLog,
}

/// RAII guard for the short-held read-modify-write lock.
struct StateGuard {
    file: File,
}

impl StateGuard {
    fn acquire(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Queue {
    /// Opens a queue rooted at the given paths.
    pub fn new(path: PathBuf, guard_path: PathBuf, backups_dir: PathBuf, log: ExecutionLog) -> Self {
        Self {
            path,
            guard_path,
            backups_dir,
            log,
        }
    }

    /// Loads the state, recovering from corruption if necessary, runs the
    /// mutation, and persists atomically. The guard lock is held across the
    /// whole cycle.
    fn with_state<T>(
        &self,
        mutate: impl FnOnce(&mut QueueState) -> T,
    ) -> Result<T, QueueError> {
        let _guard = StateGuard::acquire(&self.guard_path)?;
        let mut state = self.load_or_recover()?;
        let result = mutate(&mut state);
        self.persist(&state)?;
        Ok(result)
    }

    /// Returns a read-only view of the whole state.
    pub fn snapshot(&self) -> Result<QueueState, QueueError> {
        let _guard = StateGuard::acquire(&self.guard_path)?;
        self.load_or_recover()
    }

    /// Appends a new item per the priority ordering invariant and persists.
    pub fn enqueue(
        &self,
        task_name: &str,
        priority: Priority,
        source: ItemSource,
        trigger_payload: Option<Value>,
    ) -> Result<QueueItem, QueueError> {
        let item = self.with_state(|state| {
            let item = QueueItem {
                id: state.max_visible_id() + 1,
                task_name: task_name.to_string(),
                priority,
                enqueued_at: Utc::now(),
                attempt: 0,
                source,
                trigger_payload,
                not_before: None,
                started_at: None,
                child_pids: Vec::new(),
            };
            let position = insert_position(&state.pending, priority);
            state.pending.insert(position, item.clone());
            item
        })?;

        if let Err(err) = self.log.append(&LogEvent::new(
            EventKind::TaskQueued,
            Some(&item.task_name),
            Some(item.id),
            json!({ "source": item.source.to_string(), "priority": item.priority.to_string() }),
        )) {
            warn!("Failed to log task_queued for '{}': {err}", item.task_name);
        }

        debug!("Enqueued item {} for task '{}'", item.id, item.task_name);
        Ok(item)
    }

    /// Re-enqueues a retry copy of a finished item with `attempt + 1` and a
    /// backoff-delayed dispatch time.
    pub fn enqueue_retry(
        &self,
        failed: &QueueItem,
        backoff_base_secs: u64,
    ) -> Result<QueueItem, QueueError> {
        let delay = backoff_base_secs.saturating_mul(1u64 << failed.attempt.min(32));
        let not_before = Utc::now() + chrono::Duration::seconds(delay as i64);

        let item = self.with_state(|state| {
            let item = QueueItem {
                id: state.max_visible_id() + 1,
                task_name: failed.task_name.clone(),
                priority: failed.priority,
                enqueued_at: Utc::now(),
                attempt: failed.attempt + 1,
                source: failed.source,
                trigger_payload: failed.trigger_payload.clone(),
                not_before: Some(not_before),
                started_at: None,
                child_pids: Vec::new(),
            };
            let position = insert_position(&state.pending, item.priority);
            state.pending.insert(position, item.clone());
            item
        })?;

        info!(
            "Re-enqueued task '{}' as item {} (attempt {}, delayed {delay}s)",
            item.task_name, item.id, item.attempt
        );
        Ok(item)
    }

    /// Promotes the head-of-line eligible item to running. Returns `None`
    /// when something is already running or nothing is dispatchable yet.
    pub fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        self.with_state(|state| {
            if state.running.is_some() {
                return None;
            }
            let now = Utc::now();
            let position = state
                .pending
                .iter()
                .position(|item| item.not_before.is_none_or(|t| t <= now))?;
            let mut item = state.pending.remove(position);
            item.started_at = Some(now);
            item.not_before = None;
            state.running = Some(item.clone());
            Some(item)
        })
    }

    /// Clears the running slot and pushes the outcome onto the ring. The id
    /// must match the running item; a mismatch is logged and ignored so a
    /// duplicate completion cannot corrupt the state.
    pub fn complete(&self, id: u64, outcome: CompletedOutcome) -> Result<(), QueueError> {
        self.with_state(|state| match &state.running {
            Some(running) if running.id == id => {
                state.running = None;
                state.push_outcome(outcome);
            }
            Some(running) => {
                warn!(
                    "Completion for item {id} ignored; running item is {}",
                    running.id
                );
            }
            None => {
                warn!("Completion for item {id} ignored; nothing is running");
            }
        })
    }

    /// Records the sampled subprocess tree for the running item.
    pub fn set_running_child_pids(&self, id: u64, pids: Vec<u32>) -> Result<(), QueueError> {
        self.with_state(|state| {
            if let Some(running) = state.running.as_mut()
                && running.id == id
            {
                running.child_pids = pids;
            }
        })
    }

    /// Drops all pending items without touching the running slot.
    pub fn clear_pending(&self) -> Result<usize, QueueError> {
        self.with_state(|state| {
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        })
    }

    /// Loads the state file, archiving it and starting fresh when it does
    /// not parse or carries an unknown version tag.
    fn load_or_recover(&self) -> Result<QueueState, QueueError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueState::default());
            }
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str::<QueueState>(&raw) {
            Ok(state) if state.version == QUEUE_STATE_VERSION => Ok(state),
            Ok(state) => {
                warn!(
                    "Queue state version {} is not supported; archiving",
                    state.version
                );
                self.reset_after_corruption()
            }
            Err(err) => {
                warn!("Queue state failed to parse ({err}); archiving");
                self.reset_after_corruption()
            }
        }
    }

    /// Archives the unreadable state file and writes a fresh empty state in
    /// its place, so readers immediately see a valid file again.
    fn reset_after_corruption(&self) -> Result<QueueState, QueueError> {
        self.archive_corrupt()?;
        let state = QueueState::default();
        self.persist(&state)?;
        Ok(state)
    }

    fn archive_corrupt(&self) -> Result<(), QueueError> {
        fs::create_dir_all(&self.backups_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut archive = self.backups_dir.join(format!("queue.corrupt-{stamp}.json"));
        let mut suffix = 1;
        while archive.exists() {
            archive = self
                .backups_dir
                .join(format!("queue.corrupt-{stamp}-{suffix}.json"));
            suffix += 1;
        }
        fs::rename(&self.path, &archive)?;

        if let Err(err) = self.log.append(&LogEvent::new(
            EventKind::QueueCorrupt,
            None,
            None,
            json!({ "archived_to": archive.display().to_string() }),
        )) {
            warn!("Failed to log queue_corrupt: {err}");
        }

        warn!("Corrupt queue state archived to {:?}", archive);
        Ok(())
    }

    /// Writes the full state to a temp sibling and renames it into place.
    fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self
            .path
            .with_extension(format!("json.tmp-{}", process::id()));
        let data = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&temp)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Insertion point preserving `(priority desc, enqueued_at asc)`: a new item
/// goes before the first pending item of strictly lower priority.
fn insert_position(pending: &[QueueItem], priority: Priority) -> usize {
    pending
        .iter()
        .position(|item| item.priority < priority)
        .unwrap_or(pending.len())
}

fn pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Pid lockfile guaranteeing a single engine writer. Removed on drop.
#[derive(Debug)]
pub struct EngineLock {
    path: PathBuf,
    pid: u32,
}

impl EngineLock {
    /// Acquires the lock, reclaiming it when the recorded pid is dead.
    pub fn acquire(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let pid = process::id();
                    write!(file, "{pid}")?;
                    debug!("Engine lock acquired at {:?} (pid {pid})", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let recorded = fs::read_to_string(path)
                        .ok()
                        .and_then(|raw| raw.trim().parse::<u32>().ok());
                    match recorded {
                        Some(pid) if pid_alive(pid) => {
                            return Err(QueueError::LockHeld { pid });
                        }
                        _ => {
                            info!("Reclaiming stale engine lock at {:?}", path);
                            let _ = fs::remove_file(path);
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Lost the reclaim race three times; report whoever holds it now.
        let pid = fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Err(QueueError::LockHeld { pid })
    }

    /// Returns the pid recorded in a lockfile, if any.
    pub fn read_holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
    }

    /// Whether a lockfile exists but its recorded pid is dead.
    pub fn is_stale(path: &Path) -> bool {
        match Self::read_holder(path) {
            Some(pid) => !pid_alive(pid),
            None => false,
        }
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        // Only remove the file if it still records our pid.
        if let Some(holder) = Self::read_holder(&self.path)
            && holder == self.pid
        {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Cooperative host-load gate consulted before dispatch.
pub struct ResourceGate {
    system: System,
    max_cpu_percent: f32,
    max_memory_percent: f32,
}

impl ResourceGate {
    /// Builds a gate with thresholds from the environment or defaults.
    pub fn from_env() -> Self {
        let max_cpu_percent = std::env::var(MAX_CPU_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_MAX_CPU_PERCENT);
        let max_memory_percent = std::env::var(MAX_MEMORY_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_MAX_MEMORY_PERCENT);
        Self {
            system: System::new(),
            max_cpu_percent,
            max_memory_percent,
        }
    }

    /// Returns a human-readable reason when dispatch should be deferred.
    /// CPU readings need two samples; the first call after construction
    /// reports zero and therefore never defers.
    pub fn saturation(&mut self) -> Option<String> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_usage();
        if cpu > self.max_cpu_percent {
            return Some(format!(
                "cpu {cpu:.0}% over threshold {:.0}%",
                self.max_cpu_percent
            ));
        }

        let total = self.system.total_memory();
        if total > 0 {
            let memory = self.system.used_memory() as f32 / total as f32 * 100.0;
            if memory > self.max_memory_percent {
                return Some(format!(
                    "memory {memory:.0}% over threshold {:.0}%",
                    self.max_memory_percent
                ));
            }
        }

        None
    }
}
