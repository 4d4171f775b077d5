//! File-watch trigger service.
//!
//! One watcher process supervises every enabled task with a watch trigger.
//! Each trigger observes a single directory (no recursion), filters by glob
//! and event kind, debounces, and enqueues. The watcher never executes
//! tasks itself.
use std::{
    collections::HashMap,
    fs,
    os::unix::io::IntoRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use glob::Pattern;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use notify::{
    Event, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Priority, TaskDefinition, Trigger, WatchEventKind},
    constants::{WATCHER_BACKOFF_CAP, WATCHER_BACKOFF_INITIAL, WATCHER_STOP_GRACE},
    error::WatcherError,
    logs::{EventKind, ExecutionLog, LogEvent},
    queue::{ItemSource, Queue},
    runtime,
};

/// One armed file-watch trigger.
#[derive(Debug, Clone)]
pub struct WatchTrigger {
    /// Task enqueued when the trigger fires.
    pub task: String,
    /// Priority the enqueued item carries.
    pub priority: Priority,
    /// Directory observed, without recursion.
    pub path: PathBuf,
    /// Glob applied to file names within the directory.
    pub pattern: Pattern,
    /// Event kind the trigger reacts to.
    pub event: WatchEventKind,
    /// Coalescing window for repeated events on one path.
    pub debounce: Duration,
}

/// Extracts the watch triggers from the enabled tasks.
pub fn watch_triggers(tasks: &[TaskDefinition]) -> Vec<WatchTrigger> {
    tasks
        .iter()
        .filter(|task| task.enabled)
        .filter_map(|task| match &task.trigger {
            Some(Trigger::Watch { path, pattern, event, debounce_ms }) => {
                let pattern = Pattern::new(pattern).ok()?;
                Some(WatchTrigger {
                    task: task.name.clone(),
                    priority: task.priority,
                    path: path.clone(),
                    pattern,
                    event: *event,
                    debounce: Duration::from_millis(*debounce_ms),
                })
            }
            _ => None,
        })
        .collect()
}

/// Maps an OS notification to the trigger event model. Atomic renames into
/// the directory count as `created`.
pub fn map_event_kind(kind: &NotifyEventKind) -> Option<WatchEventKind> {
    match kind {
        NotifyEventKind::Create(_) => Some(WatchEventKind::Created),
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(WatchEventKind::Created)
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            Some(WatchEventKind::Created)
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(WatchEventKind::Deleted)
        }
        NotifyEventKind::Modify(_) => Some(WatchEventKind::Modified),
        NotifyEventKind::Remove(_) => Some(WatchEventKind::Deleted),
        _ => None,
    }
}

/// Whether a concrete filesystem event fires the trigger: same directory,
/// matching file name, matching kind.
pub fn trigger_matches(trigger: &WatchTrigger, path: &Path, kind: WatchEventKind) -> bool {
    if kind != trigger.event {
        return false;
    }
    // Notification backends may report canonicalized paths.
    let parent_matches = path.parent().is_some_and(|parent| {
        parent == trigger.path
            || match (parent.canonicalize(), trigger.path.canonicalize()) {
                (Ok(reported), Ok(configured)) => reported == configured,
                _ => false,
            }
    });
    if !parent_matches {
        return false;
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| trigger.pattern.matches(name))
}

enum Inbox {
    Fs { trigger: usize, path: PathBuf, kind: WatchEventKind },
    Lost { trigger: usize },
}

struct ArmedWatcher {
    watcher: Option<RecommendedWatcher>,
    rearm_at: Option<Instant>,
    backoff: Duration,
}

/// The watcher service: owns the armed triggers and the debounce state.
pub struct WatcherService {
    triggers: Vec<WatchTrigger>,
    queue: Queue,
    log: ExecutionLog,
}

impl WatcherService {
    /// Builds the service. Triggers whose directory is missing are kept
    /// disarmed with a warning rather than aborting.
    pub fn new(
        triggers: Vec<WatchTrigger>,
        queue: Queue,
        log: ExecutionLog,
    ) -> Result<Self, WatcherError> {
        if triggers.is_empty() {
            return Err(WatcherError::NoTriggers);
        }
        Ok(Self { triggers, queue, log })
    }

    fn arm(
        &self,
        index: usize,
        tx: &mpsc::Sender<Inbox>,
    ) -> Result<RecommendedWatcher, WatcherError> {
        let trigger = &self.triggers[index];
        let tx = tx.clone();
        let error_tx = tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        if let Some(kind) = map_event_kind(&event.kind) {
                            // Rename pairs carry (from, to); the destination
                            // is the path that now exists.
                            let path = match event.kind {
                                NotifyEventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                                    event.paths.last().cloned()
                                }
                                _ => event.paths.first().cloned(),
                            };
                            if let Some(path) = path {
                                let _ = tx.send(Inbox::Fs { trigger: index, path, kind });
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Notification stream error: {err}");
                        let _ = error_tx.send(Inbox::Lost { trigger: index });
                    }
                }
            })?;
        watcher.watch(&trigger.path, RecursiveMode::NonRecursive)?;
        debug!("Armed watch on {:?} for task '{}'", trigger.path, trigger.task);
        Ok(watcher)
    }

    fn enqueue_fire(&self, trigger: &WatchTrigger, path: &Path, kind: WatchEventKind) {
        let payload = json!({
            "path": path.display().to_string(),
            "event": kind.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        });

        // One retry before giving up; the queue lock may be briefly held.
        let mut result = self.queue.enqueue(
            &trigger.task,
            trigger.priority,
            ItemSource::Watch,
            Some(payload.clone()),
        );
        if result.is_err() {
            thread::sleep(Duration::from_millis(100));
            result = self.queue.enqueue(
                &trigger.task,
                trigger.priority,
                ItemSource::Watch,
                Some(payload.clone()),
            );
        }

        match result {
            Ok(item) => {
                if let Err(err) = self.log.append(&LogEvent::new(
                    EventKind::WatcherEvent,
                    Some(&trigger.task),
                    Some(item.id),
                    payload,
                )) {
                    warn!("Failed to log watcher_event: {err}");
                }
                info!(
                    "Watch fired for '{}' on {:?} ({kind}); enqueued item {}",
                    trigger.task, path, item.id
                );
            }
            Err(err) => {
                error!(
                    "Failed to enqueue '{}' for watch event on {:?}: {err}",
                    trigger.task, path
                );
            }
        }
    }

    /// Runs the watch loop until `stop` is raised. Debounce is trailing
    /// edge: a repeated event on the same path extends its deadline; the
    /// enqueue happens once the window elapses quietly.
    pub fn run(&self, stop: &AtomicBool) -> Result<(), WatcherError> {
        let (tx, rx) = mpsc::channel::<Inbox>();

        let mut armed: Vec<ArmedWatcher> = Vec::with_capacity(self.triggers.len());
        for (index, trigger) in self.triggers.iter().enumerate() {
            if !trigger.path.is_dir() {
                warn!(
                    "Watch path {:?} for task '{}' does not exist; trigger disarmed",
                    trigger.path, trigger.task
                );
                armed.push(ArmedWatcher {
                    watcher: None,
                    rearm_at: None,
                    backoff: WATCHER_BACKOFF_INITIAL,
                });
                continue;
            }
            match self.arm(index, &tx) {
                Ok(watcher) => armed.push(ArmedWatcher {
                    watcher: Some(watcher),
                    rearm_at: None,
                    backoff: WATCHER_BACKOFF_INITIAL,
                }),
                Err(err) => {
                    warn!(
                        "Failed to arm watch for task '{}': {err}; will retry",
                        self.triggers[index].task
                    );
                    armed.push(ArmedWatcher {
                        watcher: None,
                        rearm_at: Some(Instant::now() + WATCHER_BACKOFF_INITIAL),
                        backoff: WATCHER_BACKOFF_INITIAL,
                    });
                }
            }
        }

        // (trigger index, path) -> (fire deadline, last seen kind)
        let mut pending: HashMap<(usize, PathBuf), (Instant, WatchEventKind)> = HashMap::new();

        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();

            // Fire debounced events whose window elapsed.
            let due: Vec<(usize, PathBuf)> = pending
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in due {
                if let Some((_, kind)) = pending.remove(&key) {
                    let (index, path) = key;
                    self.enqueue_fire(&self.triggers[index], &path, kind);
                }
            }

            // Re-establish lost watchers whose backoff elapsed.
            for (index, slot) in armed.iter_mut().enumerate() {
                if slot.watcher.is_none()
                    && let Some(rearm_at) = slot.rearm_at
                    && rearm_at <= now
                {
                    match self.arm(index, &tx) {
                        Ok(watcher) => {
                            info!("Re-established watch for task '{}'", self.triggers[index].task);
                            slot.watcher = Some(watcher);
                            slot.rearm_at = None;
                            slot.backoff = WATCHER_BACKOFF_INITIAL;
                        }
                        Err(err) => {
                            slot.backoff = (slot.backoff * 2).min(WATCHER_BACKOFF_CAP);
                            slot.rearm_at = Some(now + slot.backoff);
                            debug!(
                                "Re-arm failed for '{}' ({err}); next attempt in {:?}",
                                self.triggers[index].task, slot.backoff
                            );
                        }
                    }
                }
            }

            let timeout = pending
                .values()
                .map(|(deadline, _)| deadline.saturating_duration_since(now))
                .min()
                .unwrap_or(Duration::from_millis(200))
                .min(Duration::from_millis(200));

            match rx.recv_timeout(timeout) {
                Ok(Inbox::Fs { trigger, path, kind }) => {
                    let armed_trigger = &self.triggers[trigger];
                    if trigger_matches(armed_trigger, &path, kind) {
                        let deadline = Instant::now() + armed_trigger.debounce;
                        pending.insert((trigger, path), (deadline, kind));
                    }
                }
                Ok(Inbox::Lost { trigger }) => {
                    let slot = &mut armed[trigger];
                    slot.watcher = None;
                    slot.rearm_at = Some(Instant::now() + slot.backoff);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(())
    }
}

fn pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns the live watcher daemon pid, cleaning up a stale pidfile.
pub fn daemon_status() -> Option<u32> {
    let path = runtime::watcher_pid_path();
    let pid = fs::read_to_string(&path)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())?;
    if pid_alive(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(&path);
        None
    }
}

static DAEMON_STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_sig: libc::c_int) {
    DAEMON_STOP.store(true, Ordering::SeqCst);
}

fn daemonize_watcher(log_path: &Path) -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let logfile = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let fd = logfile.into_raw_fd();
    let devnull = fs::File::open("/dev/null")?;
    let null_fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(null_fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(null_fd);
        libc::close(fd);
    }

    Ok(())
}

/// Runs the watcher in the foreground until interrupted.
pub fn run_foreground(service: &WatcherService, stop: &AtomicBool) -> Result<(), WatcherError> {
    service.run(stop)
}

/// Detaches the watcher as a daemon: refuses to start over a live pidfile,
/// double-forks, redirects streams to the watcher log, writes the pidfile,
/// and runs the watch loop until SIGTERM.
pub fn start_daemon(service: WatcherService) -> Result<(), WatcherError> {
    if let Some(pid) = daemon_status() {
        return Err(WatcherError::AlreadyRunning { pid });
    }

    daemonize_watcher(&runtime::watcher_log_path())?;

    let pid_path = runtime::watcher_pid_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;

    let handler = handle_term as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    info!("Watcher daemon started (pid {})", std::process::id());
    let result = service.run(&DAEMON_STOP);

    let _ = fs::remove_file(&pid_path);
    info!("Watcher daemon exiting");
    result
}

/// Stops a running watcher daemon: SIGTERM, a grace window, then SIGKILL.
pub fn stop_daemon() -> Result<u32, WatcherError> {
    let pid = daemon_status().ok_or(WatcherError::NotRunning)?;

    let target = Pid::from_raw(pid as i32);
    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => return Err(std::io::Error::other(err).into()),
    }

    let deadline = Instant::now() + WATCHER_STOP_GRACE;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            let _ = fs::remove_file(runtime::watcher_pid_path());
            return Ok(pid);
        }
        thread::sleep(Duration::from_millis(100));
    }

    warn!("Watcher {pid} did not exit within grace; sending SIGKILL");
    let _ = signal::kill(target, Signal::SIGKILL);
    let _ = fs::remove_file(runtime::watcher_pid_path());
    Ok(pid)
}
