//! Append-only structured execution log.
//!
//! One JSON object per line, UTF-8, newline-terminated. The log is the
//! authoritative record consumed by `status`, `logs`, and `doctor`; free-form
//! subprocess output goes to the separate cron/watcher log files instead.
use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

use crate::{constants::LOG_FOLLOW_POLL, error::LogError};

/// Enumeration of every structured event the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    /// An item was appended to the pending queue.
    TaskQueued,
    /// An item was promoted to running and its subprocess spawned.
    TaskStarted,
    /// The subprocess finished with a success outcome.
    TaskCompleted,
    /// The subprocess finished with a failure outcome.
    TaskFailed,
    /// The subprocess exceeded its wall-clock budget.
    TaskTimeout,
    /// The engine was interrupted while the item was running.
    TaskCancelled,
    /// Cleanup signalled a process group or an orphan.
    CleanupSignal,
    /// The watcher fired a debounced filesystem event.
    WatcherEvent,
    /// The managed crontab block was installed or removed.
    CronInstalled,
    /// The queue state file was unreadable and has been archived.
    QueueCorrupt,
}

/// One structured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// UTC timestamp of the event.
    pub ts: DateTime<Utc>,
    /// What happened.
    pub event: EventKind,
    /// Task name, when the event concerns a task.
    pub task: Option<String>,
    /// Queue item id, when the event concerns an item.
    pub id: Option<u64>,
    /// Event-specific payload.
    #[serde(default)]
    pub details: Value,
}

impl LogEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event: EventKind, task: Option<&str>, id: Option<u64>, details: Value) -> Self {
        Self {
            ts: Utc::now(),
            event,
            task: task.map(str::to_string),
            id,
            details,
        }
    }
}

/// Handle on the structured log file.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    /// Creates a handle; the file itself is created lazily on first append.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event as a single JSON line.
    pub fn append(&self, event: &LogEvent) -> Result<(), LogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Reads every parseable event. Lines that fail to parse (e.g. a torn
    /// final line after a crash) are skipped rather than failing the read.
    pub fn read_all(&self) -> Result<Vec<LogEvent>, LogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEvent>(&line) {
                Ok(event) => events.push(event),
                Err(_) => continue,
            }
        }
        Ok(events)
    }

    /// Returns the last `n` events, optionally filtered by task name.
    pub fn tail(&self, n: usize, task: Option<&str>) -> Result<Vec<LogEvent>, LogError> {
        let mut events = self.read_all()?;
        if let Some(task) = task {
            events.retain(|event| event.task.as_deref() == Some(task));
        }
        let skip = events.len().saturating_sub(n);
        Ok(events.split_off(skip))
    }

    /// Polls the log file and feeds newly appended events to `sink` until
    /// `stop` is raised. Starts from the current end of file.
    pub fn follow(
        &self,
        task: Option<&str>,
        stop: &AtomicBool,
        mut sink: impl FnMut(LogEvent),
    ) -> Result<(), LogError> {
        let mut offset = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        while !stop.load(Ordering::SeqCst) {
            if let Ok(metadata) = fs::metadata(&self.path) {
                let len = metadata.len();
                if len < offset {
                    // Truncated or rotated underneath us.
                    offset = 0;
                }
                if len > offset {
                    let mut file = fs::File::open(&self.path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let reader = BufReader::new(file);
                    for line in reader.lines() {
                        let line = line?;
                        offset += line.len() as u64 + 1;
                        if let Ok(event) = serde_json::from_str::<LogEvent>(&line) {
                            if task.is_none() || event.task.as_deref() == task {
                                sink(event);
                            }
                        }
                    }
                }
            }
            thread::sleep(LOG_FOLLOW_POLL);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn temp_log() -> (tempfile::TempDir, ExecutionLog) {
        let temp = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(temp.path().join("execution.log"));
        (temp, log)
    }

    #[test]
    fn append_and_read_round_trip() {
        let (_temp, log) = temp_log();
        log.append(&LogEvent::new(
            EventKind::TaskQueued,
            Some("demo"),
            Some(1),
            json!({"source": "manual"}),
        ))
        .unwrap();
        log.append(&LogEvent::new(
            EventKind::TaskStarted,
            Some("demo"),
            Some(1),
            Value::Null,
        ))
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventKind::TaskQueued);
        assert_eq!(events[0].details["source"], "manual");
        assert_eq!(events[1].event, EventKind::TaskStarted);
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let event = LogEvent::new(EventKind::QueueCorrupt, None, None, Value::Null);
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"event\":\"queue_corrupt\""));
    }

    #[test]
    fn torn_lines_are_skipped() {
        let (_temp, log) = temp_log();
        log.append(&LogEvent::new(EventKind::TaskQueued, Some("a"), Some(1), Value::Null))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        write!(file, "{{\"ts\":\"2025-01-01T").unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn tail_filters_by_task() {
        let (_temp, log) = temp_log();
        for i in 0..5 {
            let task = if i % 2 == 0 { "even" } else { "odd" };
            log.append(&LogEvent::new(
                EventKind::TaskCompleted,
                Some(task),
                Some(i),
                Value::Null,
            ))
            .unwrap();
        }

        let tail = log.tail(2, Some("even")).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, Some(2));
        assert_eq!(tail[1].id, Some(4));
    }

    #[test]
    fn missing_file_reads_empty() {
        let temp = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(temp.path().join("missing.log"));
        assert!(log.read_all().unwrap().is_empty());
        assert!(log.tail(5, None).unwrap().is_empty());
    }

    #[test]
    fn follow_stops_on_flag() {
        let (_temp, log) = temp_log();
        log.append(&LogEvent::new(EventKind::TaskQueued, None, None, Value::Null))
            .unwrap();
        let stop = AtomicBool::new(true);
        let mut seen = 0;
        log.follow(None, &stop, |_| seen += 1).unwrap();
        // Follow starts at EOF and the stop flag was already raised.
        assert_eq!(seen, 0);
    }
}
