#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use assert_cmd::cargo::cargo_bin;
use common::{TestHome, pid_alive, wait_until};

fn watch_home() -> (TestHome, std::path::PathBuf) {
    let home = TestHome::new();
    let inbox = home.path().join("inbox");
    fs::create_dir_all(&inbox).unwrap();
    home.write_task(
        "ingest",
        &format!(
            r#"
trigger:
  type: watch
  path: {inbox}
  pattern: "*.md"
  event: created
  debounce_ms: 500
task:
  prompt: "Process the new file"
"#,
            inbox = inbox.display()
        ),
    );
    (home, inbox)
}

fn spawn_watcher(home: &TestHome) -> std::process::Child {
    Command::new(cargo_bin("clodputer"))
        .args(["watch"])
        .env("HOME", home.path())
        .env("CLODPUTER_ORPHAN_PATTERNS", "clodputer-inert-tool")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn watcher")
}

fn stop_watcher(mut child: std::process::Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let _ = child.wait();
}

#[test]
fn event_burst_within_debounce_window_enqueues_once() {
    let (home, inbox) = watch_home();
    let child = spawn_watcher(&home);

    // Give the watcher time to arm its notification handle.
    thread::sleep(Duration::from_millis(600));

    let target = inbox.join("x.md");
    fs::write(&target, "created").unwrap();
    for revision in 0..3 {
        thread::sleep(Duration::from_millis(100));
        fs::write(&target, format!("rev {revision}")).unwrap();
    }

    // Wait out the debounce window plus slack for the enqueue.
    let enqueued = wait_until(Duration::from_secs(5), || {
        home.queue_path().exists()
            && home.queue_state()["pending"].as_array().is_some_and(|p| !p.is_empty())
    });
    assert!(enqueued, "watcher never enqueued");
    // Allow any duplicate fire to surface before asserting exactly-once.
    thread::sleep(Duration::from_millis(700));

    stop_watcher(child);

    let state = home.queue_state();
    let pending = state["pending"].as_array().unwrap();
    assert_eq!(pending.len(), 1, "expected one coalesced item: {pending:?}");
    assert_eq!(pending[0]["task_name"], "ingest");
    assert_eq!(pending[0]["source"], "watch");
    assert_eq!(
        pending[0]["trigger_payload"]["path"],
        target.display().to_string()
    );
    assert_eq!(pending[0]["trigger_payload"]["event"], "created");

    assert_eq!(home.events_of_kind("watcher_event").len(), 1);
}

#[test]
fn non_matching_files_do_not_fire() {
    let (home, inbox) = watch_home();
    let child = spawn_watcher(&home);
    thread::sleep(Duration::from_millis(600));

    fs::write(inbox.join("ignored.txt"), "nope").unwrap();
    thread::sleep(Duration::from_millis(900));

    stop_watcher(child);

    assert!(home.events_of_kind("watcher_event").is_empty());
    if home.queue_path().exists() {
        assert!(home.queue_state()["pending"].as_array().unwrap().is_empty());
    }
}

#[test]
fn watch_status_reports_stopped_without_a_daemon() {
    let home = TestHome::new();
    home.command()
        .args(["watch", "--status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("watcher stopped"));
}

#[test]
fn watcher_process_exits_on_sigterm() {
    let (home, _inbox) = watch_home();
    let child = spawn_watcher(&home);
    let pid = child.id();
    thread::sleep(Duration::from_millis(500));
    assert!(pid_alive(pid));

    stop_watcher(child);
    assert!(wait_until(Duration::from_secs(5), || !pid_alive(pid)));
}
