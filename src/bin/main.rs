use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clodputer::{
    cli::{Cli, Commands, parse_args},
    config,
    cron,
    engine::Engine,
    error::{ConfigError, EngineError},
    logs::ExecutionLog,
    queue::{OutcomeStatus, Queue},
    runtime, status, watcher,
};

fn main() {
    let args = parse_args();
    runtime::init();
    init_logging(&args);

    let code = match dispatch(args.command) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    };
    process::exit(code);
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_queue() -> Queue {
    let log = ExecutionLog::new(runtime::execution_log_path());
    Queue::new(
        runtime::queue_path(),
        runtime::queue_guard_path(),
        runtime::backups_dir(),
        log,
    )
}

fn install_interrupt_handler(flag: Arc<AtomicBool>) {
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        error!("Failed to install signal handler: {err}");
    }
}

fn dispatch(command: Commands) -> Result<i32, EngineError> {
    match command {
        Commands::Run { task, priority, enqueue_only } => {
            let engine = Engine::from_runtime()?;
            install_interrupt_handler(engine.interrupt_flag());

            let disposition =
                engine.run_task(&task, priority.map(|p| p.0), enqueue_only)?;
            if !disposition.drained {
                println!("Queued '{}' as item {}", task, disposition.item.id);
                return Ok(0);
            }

            // Report the outcome of the item this invocation enqueued.
            let state = engine.queue().snapshot()?;
            let outcome = state
                .completed_recent
                .iter()
                .find(|outcome| outcome.id == disposition.item.id);
            match outcome {
                Some(outcome) => {
                    let error = outcome
                        .error
                        .as_deref()
                        .map(|kind| format!(" ({kind})"))
                        .unwrap_or_default();
                    println!(
                        "'{}' finished: {}{error} in {:.1}s",
                        task, outcome.status, outcome.duration_secs
                    );
                    match outcome.status {
                        OutcomeStatus::Success => Ok(0),
                        OutcomeStatus::Cancelled => Ok(130),
                        _ => Ok(2),
                    }
                }
                None => {
                    println!("'{}' queued as item {}", task, disposition.item.id);
                    Ok(0)
                }
            }
        }

        Commands::Queue { clear } => {
            let queue = open_queue();
            if clear {
                let dropped = queue.clear_pending()?;
                println!("Cleared {dropped} pending item(s)");
                return Ok(0);
            }

            let state = queue.snapshot()?;
            match &state.running {
                Some(item) => println!(
                    "running: #{} '{}' (attempt {})",
                    item.id, item.task_name, item.attempt
                ),
                None => println!("running: none"),
            }
            if state.pending.is_empty() {
                println!("pending: none");
            } else {
                println!("pending:");
                for item in &state.pending {
                    println!(
                        "  #{} '{}' [{}] via {}",
                        item.id, item.task_name, item.priority, item.source
                    );
                }
            }
            Ok(0)
        }

        Commands::Status { json } => {
            let queue = open_queue();
            let snapshot = status::collect(&queue)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot)
                        .map_err(|err| EngineError::Log(err.into()))?
                );
            } else {
                print!("{}", status::render_human(&snapshot));
            }
            Ok(0)
        }

        Commands::Logs { tail, follow, task, json } => {
            let log = ExecutionLog::new(runtime::execution_log_path());

            let render = move |event: &clodputer::logs::LogEvent| {
                if json {
                    match serde_json::to_string(event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => error!("Failed to encode event: {err}"),
                    }
                } else {
                    let task = event.task.as_deref().unwrap_or("-");
                    let id = event
                        .id
                        .map(|id| format!("#{id}"))
                        .unwrap_or_else(|| "-".into());
                    println!("{} {} {task} {id} {}", event.ts, event.event, event.details);
                }
            };

            for event in log.tail(tail, task.as_deref())? {
                render(&event);
            }

            if follow {
                let stop = Arc::new(AtomicBool::new(false));
                install_interrupt_handler(Arc::clone(&stop));
                log.follow(task.as_deref(), &stop, |event| render(&event))?;
            }
            Ok(0)
        }

        Commands::Install { dry_run } => {
            let tasks = config::load_tasks(&runtime::tasks_dir())?;
            let log = ExecutionLog::new(runtime::execution_log_path());
            let report = cron::install(&tasks, &log, dry_run)?;
            if dry_run {
                println!("Would install {} scheduled task(s):", report.entries);
                print!("{}", report.text);
            } else if report.changed {
                println!("Installed {} scheduled task(s)", report.entries);
            } else {
                println!("Crontab already up to date ({} task(s))", report.entries);
            }
            Ok(0)
        }

        Commands::Uninstall { dry_run } => {
            let log = ExecutionLog::new(runtime::execution_log_path());
            let report = cron::uninstall(&log, dry_run)?;
            if dry_run {
                println!("Crontab after uninstall would be:");
                print!("{}", report.text);
            } else if report.changed {
                println!("Removed managed crontab block");
            } else {
                println!("No managed crontab block to remove");
            }
            Ok(0)
        }

        Commands::SchedulePreview { task, count } => {
            let def = config::load_task(&runtime::tasks_dir(), &task)?;
            let (expression, timezone) = match &def.trigger {
                Some(config::Trigger::Cron { expression, timezone }) => {
                    (expression.clone(), timezone.clone())
                }
                Some(config::Trigger::Interval { seconds }) => {
                    let expression = cron::interval_expression(*seconds).ok_or(
                        EngineError::Config(ConfigError::InvalidTask {
                            task: task.clone(),
                            reason: format!("interval {seconds}s has no crontab equivalent"),
                        }),
                    )?;
                    (expression, None)
                }
                _ => {
                    return Err(EngineError::Config(ConfigError::InvalidTask {
                        task: task.clone(),
                        reason: "task has no schedule to preview".into(),
                    }));
                }
            };

            let times = cron::preview(&expression, timezone.as_deref(), &task, count)?;
            println!("Next {} firing(s) of '{task}' ({expression}):", times.len());
            for time in times {
                println!("  {}", time.to_rfc3339());
            }
            Ok(0)
        }

        Commands::Watch { daemon, stop, status: watch_status } => {
            if watch_status {
                match watcher::daemon_status() {
                    Some(pid) => println!("watcher running (pid {pid})"),
                    None => println!("watcher stopped"),
                }
                return Ok(0);
            }
            if stop {
                let pid = watcher::stop_daemon()?;
                println!("Stopped watcher (pid {pid})");
                return Ok(0);
            }

            let tasks = config::load_tasks(&runtime::tasks_dir())?;
            let triggers = watcher::watch_triggers(&tasks);
            let log = ExecutionLog::new(runtime::execution_log_path());
            let service = watcher::WatcherService::new(triggers, open_queue(), log)?;

            if daemon {
                watcher::start_daemon(service)?;
            } else {
                info!("Watching; press Ctrl-C to stop");
                let stop_flag = Arc::new(AtomicBool::new(false));
                install_interrupt_handler(Arc::clone(&stop_flag));
                watcher::run_foreground(&service, &stop_flag)?;
            }
            Ok(0)
        }

        Commands::Doctor => {
            let tasks = config::load_tasks(&runtime::tasks_dir())?;
            let log = ExecutionLog::new(runtime::execution_log_path());
            let checks = status::doctor(&tasks, &log);
            print!("{}", status::render_doctor(&checks));
            if status::doctor_ok(&checks) {
                Ok(0)
            } else {
                Ok(3)
            }
        }
    }
}
