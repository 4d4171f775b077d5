//! Runs one queue item through the assistant CLI.
//!
//! The executor resolves a task definition into an argv, substitutes prompt
//! placeholders, spawns the assistant as a process-group leader, enforces the
//! wall-clock budget, classifies the output, and runs the outcome handlers.
use std::{
    collections::BTreeMap,
    io::{Read, Write},
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use regex::Regex;
use serde_json::{Value, json};
use strum_macros::Display;
use sysinfo::System;
use tracing::{debug, warn};

use crate::{
    cleanup,
    config::{HandlerAction, Secrets, TaskDefinition},
    constants::{
        CLAUDE_BIN_ENV, DEFAULT_CLAUDE_BIN, EXTRA_ARGS_ENV, PID_SAMPLE_INTERVAL,
        RAW_OUTPUT_CAP,
    },
    error::ExecutorError,
    logs::{EventKind, ExecutionLog, LogEvent},
    queue::{OutcomeStatus, Queue, QueueItem},
};

/// Why a task run is considered failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FailureKind {
    /// The item referenced an unknown/disabled task or an unresolvable
    /// placeholder; nothing was spawned.
    Config,
    /// Non-zero exit with no parseable output.
    Exit,
    /// Zero exit but stdout was not a single JSON value.
    Parse,
    /// The assistant returned a parseable error payload.
    Reported,
}

/// Terminal classification of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Clean JSON payload from the assistant.
    Success {
        /// The parsed response payload.
        payload: Value,
    },
    /// The run failed; see the kind for why.
    Failure {
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable message.
        message: String,
        /// Whether retry accounting applies.
        retriable: bool,
    },
    /// The wall-clock budget expired and the tree was terminated.
    Timeout,
    /// The engine was interrupted mid-run.
    Cancelled,
}

impl TaskOutcome {
    /// Queue-facing status for the completed ring.
    pub fn status(&self) -> OutcomeStatus {
        match self {
            TaskOutcome::Success { .. } => OutcomeStatus::Success,
            TaskOutcome::Failure { .. } => OutcomeStatus::Failure,
            TaskOutcome::Timeout => OutcomeStatus::Timeout,
            TaskOutcome::Cancelled => OutcomeStatus::Cancelled,
        }
    }

    /// Error kind string for the completed ring, when not a success.
    pub fn error_kind(&self) -> Option<String> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { kind, .. } => Some(kind.to_string()),
            TaskOutcome::Timeout => Some("timeout".into()),
            TaskOutcome::Cancelled => Some("cancelled".into()),
        }
    }

    /// Whether the outcome participates in retry accounting.
    pub fn is_retriable(&self) -> bool {
        match self {
            TaskOutcome::Success { .. } | TaskOutcome::Cancelled => false,
            TaskOutcome::Timeout => true,
            TaskOutcome::Failure { kind, retriable, .. } => match kind {
                FailureKind::Config => false,
                FailureKind::Exit | FailureKind::Parse => true,
                FailureKind::Reported => *retriable,
            },
        }
    }

    /// The structured event kind emitted for this outcome.
    pub fn event_kind(&self) -> EventKind {
        match self {
            TaskOutcome::Success { .. } => EventKind::TaskCompleted,
            TaskOutcome::Failure { .. } => EventKind::TaskFailed,
            TaskOutcome::Timeout => EventKind::TaskTimeout,
            TaskOutcome::Cancelled => EventKind::TaskCancelled,
        }
    }
}

/// Result of one execution, consumed by the engine for completion and retry.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Classified outcome.
    pub outcome: TaskOutcome,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Child exit code, when it exited normally.
    pub exit_code: Option<i32>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(context|env|secrets)\.([A-Za-z0-9_]+)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

/// Substitutes `{{ context.KEY }}`, `{{ env.VAR }}` and `{{ secrets.NAME }}`
/// placeholders. Unknown keys are an error; a prompt must never be
/// dispatched half-substituted.
pub fn substitute(
    template: &str,
    context: &BTreeMap<String, String>,
    secrets: &Secrets,
) -> Result<String, String> {
    let mut missing = Vec::new();
    let result = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
        let namespace = &caps[1];
        let key = &caps[2];
        let value = match namespace {
            "context" => context.get(key).cloned(),
            "env" => std::env::var(key).ok(),
            "secrets" => secrets.get(key).map(str::to_string),
            _ => None,
        };
        match value {
            Some(value) => value,
            None => {
                missing.push(format!("{namespace}.{key}"));
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(result.into_owned())
    } else {
        Err(format!("unresolved placeholders: {}", missing.join(", ")))
    }
}

/// The resolved argv for one task, prompt excluded (it goes on stdin).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Binary to execute.
    pub program: String,
    /// Arguments in dispatch order.
    pub args: Vec<String>,
}

/// Builds the assistant argv from the task definition and environment.
pub fn build_command(def: &TaskDefinition) -> CommandSpec {
    let program =
        std::env::var(CLAUDE_BIN_ENV).unwrap_or_else(|_| DEFAULT_CLAUDE_BIN.to_string());

    let mut args = vec![
        "--output-format".to_string(),
        "json".to_string(),
        "--permission-mode".to_string(),
        def.task.permission_mode.as_ref().to_string(),
    ];

    if !def.task.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(def.task.allowed_tools.join(","));
    }
    if !def.task.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(def.task.disallowed_tools.join(","));
    }
    if let Some(mcp_config) = &def.task.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(mcp_config.display().to_string());
    }
    if let Ok(extra) = std::env::var(EXTRA_ARGS_ENV) {
        args.extend(extra.split_whitespace().map(str::to_string));
    }

    CommandSpec { program, args }
}

/// Classifies the child's exit and stdout per the outcome contract.
pub fn classify_output(exit_code: Option<i32>, stdout: &[u8]) -> TaskOutcome {
    let text = String::from_utf8_lossy(stdout);
    let parsed: Result<Value, _> = serde_json::from_str(text.trim());

    match (exit_code, parsed) {
        (Some(0), Ok(value)) => classify_payload(value),
        (Some(0), Err(_)) => TaskOutcome::Failure {
            kind: FailureKind::Parse,
            // Preserve the raw output (capped) so the user can inspect what
            // the assistant actually printed.
            message: truncate_raw(&text),
            retriable: true,
        },
        (Some(code), Ok(value)) => match classify_payload(value) {
            // A reported error beats the bare exit code for diagnostics.
            failure @ TaskOutcome::Failure { .. } => failure,
            _ => TaskOutcome::Failure {
                kind: FailureKind::Exit,
                message: format!("exit code {code}"),
                retriable: true,
            },
        },
        (Some(code), Err(_)) => TaskOutcome::Failure {
            kind: FailureKind::Exit,
            message: format!("exit code {code}"),
            retriable: true,
        },
        (None, _) => TaskOutcome::Failure {
            kind: FailureKind::Exit,
            message: "terminated by signal".to_string(),
            retriable: true,
        },
    }
}

fn classify_payload(value: Value) -> TaskOutcome {
    let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || value.get("error").is_some_and(|v| !v.is_null());

    if !is_error {
        return TaskOutcome::Success { payload: value };
    }

    let message = value
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            value
                .get("error")
                .map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
        })
        .unwrap_or_else(|| "assistant reported an error".to_string());
    let retriable = value
        .get("retriable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    TaskOutcome::Failure {
        kind: FailureKind::Reported,
        message,
        retriable,
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    let mut end = trimmed.len().min(256);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

fn truncate_raw(text: &str) -> String {
    let mut end = text.len().min(RAW_OUTPUT_CAP);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn spawn_reader(stream: impl Read + Send + 'static) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut stream = stream;
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn wait_with_budget(
    child: &mut Child,
    item: &QueueItem,
    queue: &Queue,
    deadline: Instant,
    interrupted: &AtomicBool,
    log: &ExecutionLog,
    task_name: &str,
) -> Result<Option<TaskOutcome>, ExecutorError> {
    let leader = child.id();
    let mut system = System::new();
    let mut last_sample = Instant::now() - PID_SAMPLE_INTERVAL;
    let mut last_pids: Vec<u32> = Vec::new();

    loop {
        if let Some(status) = child.try_wait()? {
            debug!("Task '{task_name}' exited with {status}");
            return Ok(None);
        }

        if interrupted.load(Ordering::SeqCst) {
            cleanup::terminate_group(leader, log, Some(task_name), Some(item.id));
            let _ = child.wait();
            return Ok(Some(TaskOutcome::Cancelled));
        }

        if Instant::now() >= deadline {
            cleanup::terminate_group(leader, log, Some(task_name), Some(item.id));
            let _ = child.wait();
            return Ok(Some(TaskOutcome::Timeout));
        }

        if last_sample.elapsed() >= PID_SAMPLE_INTERVAL {
            last_sample = Instant::now();
            let pids = cleanup::sample_group_pids(leader, &mut system);
            if pids != last_pids {
                last_pids = pids.clone();
                if let Err(err) = queue.set_running_child_pids(item.id, pids) {
                    warn!("Failed to persist child pids: {err}");
                }
            }
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Runs one item to completion: spawn, budget, classify, clean up, handlers,
/// terminal log event. Always leaves the process group dead.
pub fn execute(
    item: &QueueItem,
    def: &TaskDefinition,
    secrets: &Secrets,
    queue: &Queue,
    log: &ExecutionLog,
    interrupted: &AtomicBool,
) -> Result<ExecutionReport, ExecutorError> {
    let started = Instant::now();

    // Trigger payload values are exposed to the prompt alongside the task's
    // own context map.
    let mut context = def.task.context.clone();
    if let Some(payload) = &item.trigger_payload
        && let Some(object) = payload.as_object()
    {
        for (key, value) in object {
            let rendered = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            context.entry(key.to_uppercase()).or_insert(rendered);
        }
    }

    let prompt = match substitute(&def.task.prompt, &context, secrets) {
        Ok(prompt) => prompt,
        Err(message) => {
            let outcome = TaskOutcome::Failure {
                kind: FailureKind::Config,
                message,
                retriable: false,
            };
            finish(item, def, secrets, &context, log, &outcome, started, None)?;
            return Ok(ExecutionReport {
                outcome,
                duration: started.elapsed(),
                exit_code: None,
            });
        }
    };

    let spec = build_command(def);
    debug!("Dispatching '{}' via {} {:?}", def.name, spec.program, spec.args);

    if let Err(err) = log.append(&LogEvent::new(
        EventKind::TaskStarted,
        Some(&def.name),
        Some(item.id),
        json!({ "attempt": item.attempt, "source": item.source.to_string() }),
    )) {
        warn!("Failed to log task_started: {err}");
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    // Secrets ride along in the child environment as well as through
    // prompt substitution.
    for (key, value) in secrets.iter() {
        command.env(key, value);
    }
    let mut child = command
        .spawn()
        .map_err(|source| ExecutorError::SpawnError {
            task: def.name.clone(),
            source,
        })?;

    let leader = child.id();

    // Feed the prompt from a thread so a child that never reads cannot
    // deadlock us against a full pipe.
    let stdin = child.stdin.take();
    let prompt_writer = thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(prompt.as_bytes());
        }
    });

    let stdout_reader = spawn_reader(child.stdout.take().expect("stdout piped"));
    let stderr_reader = spawn_reader(child.stderr.take().expect("stderr piped"));

    let deadline = started + Duration::from_secs(def.task.timeout_secs);
    let premature = wait_with_budget(
        &mut child,
        item,
        queue,
        deadline,
        interrupted,
        log,
        &def.name,
    )?;

    let _ = prompt_writer.join();
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    let exit_code = child.try_wait().ok().flatten().and_then(|status| status.code());

    let outcome = match premature {
        Some(outcome) => outcome,
        None => classify_output(exit_code, &stdout),
    };

    if !stderr.is_empty() {
        debug!(
            "Task '{}' stderr: {}",
            def.name,
            preview(&String::from_utf8_lossy(&stderr))
        );
    }

    // Unconditional teardown: the group must be dead before the item leaves
    // the running slot, and stray tool servers get swept.
    cleanup::terminate_group(leader, log, Some(&def.name), Some(item.id));
    let patterns = cleanup::orphan_patterns();
    let mut system = System::new();
    cleanup::orphan_sweep(&patterns, &mut system, log, Some(&def.name), Some(item.id));

    finish(item, def, secrets, &context, log, &outcome, started, exit_code)?;

    Ok(ExecutionReport {
        duration: started.elapsed(),
        exit_code,
        outcome,
    })
}

/// Runs the matching handler list and emits the single terminal log event.
#[allow(clippy::too_many_arguments)]
fn finish(
    item: &QueueItem,
    def: &TaskDefinition,
    secrets: &Secrets,
    context: &BTreeMap<String, String>,
    log: &ExecutionLog,
    outcome: &TaskOutcome,
    started: Instant,
    exit_code: Option<i32>,
) -> Result<(), ExecutorError> {
    let handlers = match outcome.status() {
        OutcomeStatus::Success => &def.on_success,
        _ => &def.on_failure,
    };

    let mut handler_log = Vec::new();
    let mut notified = false;
    for action in handlers {
        match action {
            HandlerAction::Log { message } => match substitute(message, context, secrets) {
                Ok(line) => handler_log.push(line),
                Err(err) => warn!("Handler log line skipped for '{}': {err}", def.name),
            },
            HandlerAction::Notify { enabled } => {
                if *enabled {
                    notified = notify(&def.name, outcome);
                }
            }
        }
    }

    let mut details = json!({
        "outcome": outcome.status().to_string(),
        "duration_secs": started.elapsed().as_secs_f64(),
    });
    if let Some(kind) = outcome.error_kind() {
        details["error"] = json!(kind);
    }
    if let TaskOutcome::Failure { message, .. } = outcome {
        details["message"] = json!(message);
    }
    if let TaskOutcome::Success { payload } = outcome {
        details["payload"] = payload.clone();
    }
    if let Some(code) = exit_code {
        details["exit_code"] = json!(code);
    }
    if !handler_log.is_empty() {
        details["handler_log"] = json!(handler_log);
    }
    if notified {
        details["notified"] = json!(true);
    }

    log.append(&LogEvent::new(
        outcome.event_kind(),
        Some(&def.name),
        Some(item.id),
        details,
    ))
    .map_err(|err| match err {
        crate::error::LogError::Io(io) => ExecutorError::Io(io),
        crate::error::LogError::Encode(e) => {
            ExecutorError::Io(std::io::Error::other(e))
        }
    })
}

/// Best-effort desktop notification; failures never change the outcome.
fn notify(task: &str, outcome: &TaskOutcome) -> bool {
    let body = match outcome {
        TaskOutcome::Success { .. } => format!("Task '{task}' completed"),
        TaskOutcome::Failure { kind, message, .. } => {
            format!("Task '{task}' failed ({kind}): {message}")
        }
        TaskOutcome::Timeout => format!("Task '{task}' timed out"),
        TaskOutcome::Cancelled => format!("Task '{task}' was cancelled"),
    };

    match notify_rust::Notification::new()
        .summary("Clodputer")
        .body(&body)
        .show()
    {
        Ok(_) => true,
        Err(err) => {
            warn!("Desktop notification failed for '{task}': {err}");
            false
        }
    }
}
