//! The execution engine: a value tying the queue, executor, and cleanup
//! together behind the single-writer lockfile.
//!
//! The engine is constructed from explicit paths so tests can point it at a
//! temporary directory; nothing in here reaches for process-wide state
//! beyond the environment variables documented in the CLI contract.
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    cleanup, config,
    config::{Priority, Secrets, TaskDefinition},
    constants::RESOURCE_GATE_RECHECK,
    error::{ConfigError, EngineError},
    executor::{self, FailureKind, TaskOutcome},
    logs::{EventKind, ExecutionLog, LogEvent},
    queue::{
        CompletedOutcome, EngineLock, ItemSource, Queue, QueueItem, ResourceGate,
    },
    runtime,
};

/// How a `run` invocation was handled.
#[derive(Debug)]
pub struct RunDisposition {
    /// The enqueued item.
    pub item: QueueItem,
    /// Whether this process drained the queue itself (false when another
    /// engine already holds the lock and will pick the item up).
    pub drained: bool,
}

/// The engine value with explicit dependencies.
pub struct Engine {
    tasks_dir: PathBuf,
    lock_path: PathBuf,
    queue: Queue,
    log: ExecutionLog,
    secrets: Secrets,
    interrupted: Arc<AtomicBool>,
}

impl Engine {
    /// Builds an engine rooted at the standard `~/.clodputer` layout.
    pub fn from_runtime() -> Result<Self, EngineError> {
        let log = ExecutionLog::new(runtime::execution_log_path());
        let queue = Queue::new(
            runtime::queue_path(),
            runtime::queue_guard_path(),
            runtime::backups_dir(),
            log.clone(),
        );
        let secrets = Secrets::load(&runtime::secrets_path())
            .map_err(|err| EngineError::Config(ConfigError::ReadError(err)))?;

        Ok(Self {
            tasks_dir: runtime::tasks_dir(),
            lock_path: runtime::engine_lock_path(),
            queue,
            log,
            secrets,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds an engine over explicit paths, for tests.
    pub fn with_paths(
        tasks_dir: PathBuf,
        lock_path: PathBuf,
        queue: Queue,
        log: ExecutionLog,
        secrets: Secrets,
    ) -> Self {
        Self {
            tasks_dir,
            lock_path,
            queue,
            log,
            secrets,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The queue this engine drains.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The structured log this engine writes.
    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Shared flag raised by the signal handler to stop dequeueing.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Resolves a task definition, mapping unknown/disabled to config errors.
    fn resolve(&self, name: &str) -> Result<TaskDefinition, ConfigError> {
        let def = config::load_task(&self.tasks_dir, name)?;
        if !def.enabled {
            return Err(ConfigError::DisabledTask(name.to_string()));
        }
        Ok(def)
    }

    /// Validates and enqueues a manual run.
    pub fn enqueue_manual(
        &self,
        task: &str,
        priority: Option<Priority>,
    ) -> Result<QueueItem, EngineError> {
        let def = self.resolve(task)?;
        let priority = priority.unwrap_or(def.priority);
        let item = self
            .queue
            .enqueue(&def.name, priority, ItemSource::Manual, None)?;
        Ok(item)
    }

    /// Enqueues and, unless another engine holds the lock, drains the queue.
    pub fn run_task(
        &self,
        task: &str,
        priority: Option<Priority>,
        enqueue_only: bool,
    ) -> Result<RunDisposition, EngineError> {
        let item = self.enqueue_manual(task, priority)?;
        if enqueue_only {
            return Ok(RunDisposition { item, drained: false });
        }

        match self.drain() {
            Ok(()) => Ok(RunDisposition { item, drained: true }),
            Err(EngineError::Queue(crate::error::QueueError::LockHeld { pid })) => {
                info!("Engine already running (pid {pid}); item {} queued", item.id);
                Ok(RunDisposition { item, drained: false })
            }
            Err(err) => Err(err),
        }
    }

    /// Finishes the job for an item left in the running slot by a crashed
    /// engine: the recorded subprocess tree is terminated and the item is
    /// recorded as cancelled.
    fn recover_stale_running(&self) -> Result<(), EngineError> {
        let snapshot = self.queue.snapshot()?;
        let Some(stale) = snapshot.running else {
            return Ok(());
        };

        warn!(
            "Recovering item {} ('{}') left running by a previous engine",
            stale.id, stale.task_name
        );
        if let Some(&leader) = stale.child_pids.first() {
            cleanup::terminate_group(leader, &self.log, Some(&stale.task_name), Some(stale.id));
        }
        cleanup::kill_recorded_pids(
            &stale.child_pids,
            &self.log,
            Some(&stale.task_name),
            Some(stale.id),
        );

        let duration = stale
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.queue.complete(
            stale.id,
            CompletedOutcome {
                id: stale.id,
                task_name: stale.task_name.clone(),
                status: crate::queue::OutcomeStatus::Cancelled,
                duration_secs: duration,
                error: Some("cancelled".into()),
                completed_at: Utc::now(),
            },
        )?;
        self.log
            .append(&LogEvent::new(
                EventKind::TaskCancelled,
                Some(&stale.task_name),
                Some(stale.id),
                serde_json::json!({ "reason": "recovered after engine crash" }),
            ))
            .map_err(EngineError::Log)?;
        Ok(())
    }

    /// Acquires the lock and runs queue items one at a time until the queue
    /// is empty or the engine is interrupted.
    pub fn drain(&self) -> Result<(), EngineError> {
        let _lock = EngineLock::acquire(&self.lock_path)?;
        self.recover_stale_running()?;

        let mut gate = ResourceGate::from_env();

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(EngineError::Interrupted);
            }

            // Cooperative politeness: defer dispatch while the host is busy.
            while let Some(reason) = gate.saturation() {
                info!("Dispatch deferred: {reason}");
                thread::sleep(RESOURCE_GATE_RECHECK);
                if self.interrupted.load(Ordering::SeqCst) {
                    return Err(EngineError::Interrupted);
                }
            }

            let Some(item) = self.queue.dequeue()? else {
                let snapshot = self.queue.snapshot()?;
                if snapshot.pending.is_empty() {
                    debug!("Queue drained");
                    return Ok(());
                }
                // Items exist but are backoff-delayed; wait for eligibility.
                thread::sleep(Duration::from_millis(500));
                continue;
            };

            self.execute_item(item)?;
        }
    }

    fn execute_item(&self, item: QueueItem) -> Result<(), EngineError> {
        let started = Utc::now();

        let def = match self.resolve(&item.task_name) {
            Ok(def) => def,
            Err(err) => {
                // Fatal for the item, not for the engine.
                warn!("Item {} dropped: {err}", item.id);
                self.log
                    .append(&LogEvent::new(
                        EventKind::TaskFailed,
                        Some(&item.task_name),
                        Some(item.id),
                        serde_json::json!({
                            "outcome": "failure",
                            "error": "config",
                            "message": err.to_string(),
                        }),
                    ))
                    .map_err(EngineError::Log)?;
                self.queue.complete(
                    item.id,
                    CompletedOutcome {
                        id: item.id,
                        task_name: item.task_name.clone(),
                        status: crate::queue::OutcomeStatus::Failure,
                        duration_secs: 0.0,
                        error: Some(FailureKind::Config.to_string()),
                        completed_at: Utc::now(),
                    },
                )?;
                return Ok(());
            }
        };

        let report = executor::execute(
            &item,
            &def,
            &self.secrets,
            &self.queue,
            &self.log,
            &self.interrupted,
        )?;

        self.queue.complete(
            item.id,
            CompletedOutcome {
                id: item.id,
                task_name: item.task_name.clone(),
                status: report.outcome.status(),
                duration_secs: report.duration.as_secs_f64(),
                error: report.outcome.error_kind(),
                completed_at: Utc::now(),
            },
        )?;

        debug!(
            "Item {} finished as {} in {:.1}s (started {})",
            item.id,
            report.outcome.status(),
            report.duration.as_secs_f64(),
            started,
        );

        if matches!(report.outcome, TaskOutcome::Cancelled) {
            return Err(EngineError::Interrupted);
        }

        if report.outcome.is_retriable() && item.attempt < def.max_retries {
            self.queue
                .enqueue_retry(&item, def.retry_backoff_seconds)?;
        }

        Ok(())
    }
}
