#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::TestHome;
use predicates::prelude::*;

#[test]
fn corrupt_queue_is_archived_and_reset_on_next_start() {
    let home = TestHome::new();
    fs::create_dir_all(home.state_dir()).unwrap();
    fs::write(home.queue_path(), "not json").unwrap();

    // Any queue access recovers; the engine never refuses to start.
    home.command()
        .arg("queue")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending: none"));

    // The fresh state is valid and empty.
    let state = home.queue_state();
    assert_eq!(state["version"], 1);
    assert!(state["pending"].as_array().unwrap().is_empty());
    assert!(state["running"].is_null());

    // The original bytes were archived with a timestamped name.
    let archives: Vec<String> = fs::read_dir(home.backups_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("queue.corrupt-"))
        .collect();
    assert_eq!(archives.len(), 1);
    let archived = fs::read_to_string(home.backups_dir().join(&archives[0])).unwrap();
    assert_eq!(archived, "not json");

    assert_eq!(home.events_of_kind("queue_corrupt").len(), 1);
}

#[test]
fn status_renders_idle_system() {
    let home = TestHome::new();
    home.command()
        .arg("status")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("engine:   idle")
                .and(predicate::str::contains("watcher:  stopped"))
                .and(predicate::str::contains("pending:  0")),
        );
}

#[test]
fn status_json_is_machine_readable() {
    let home = TestHome::new();
    home.write_task("demo", "task:\n  prompt: hi\n");
    home.command()
        .args(["run", "demo", "--enqueue-only"])
        .assert()
        .success();

    let output = home
        .command()
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let snapshot: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(snapshot["pending"], 1);
    assert!(snapshot["running"].is_null());
    assert!(snapshot["engine_pid"].is_null());
}

#[test]
fn stale_lockfile_is_reported_and_reclaimed() {
    let home = TestHome::new();
    fs::create_dir_all(home.state_dir()).unwrap();
    // A pid far beyond any Linux pid_max.
    fs::write(home.state_dir().join("clodputer.lock"), "999999999").unwrap();

    home.command()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("stale lock"));

    // Running a task reclaims the stale lock and proceeds.
    home.write_task("demo", "task:\n  prompt: hi\n");
    let fake = home.write_script(
        "fake-assistant.sh",
        "#!/bin/sh\ncat > /dev/null\necho '{\"result\": \"ok\"}'\n",
    );
    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "demo"])
        .assert()
        .success();
    assert!(!home.state_dir().join("clodputer.lock").exists());
}

#[test]
fn doctor_is_healthy_on_a_fresh_home_and_unhealthy_on_corruption() {
    let home = TestHome::new();
    let shim = home.install_crontab_shim();
    let path_env = format!("{}:{}", shim.display(), std::env::var("PATH").unwrap());

    home.command()
        .env("PATH", &path_env)
        .env("CLODPUTER_CLAUDE_BIN", "/bin/sh")
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("queue_state"));

    fs::write(home.queue_path(), "garbage").unwrap();
    home.command()
        .env("PATH", &path_env)
        .env("CLODPUTER_CLAUDE_BIN", "/bin/sh")
        .arg("doctor")
        .assert()
        .code(3)
        .stdout(predicate::str::contains("unreadable or corrupt"));
}

#[test]
fn logs_tail_and_json_render_recorded_events() {
    let home = TestHome::new();
    home.write_task("demo", "task:\n  prompt: hi\n");
    home.command()
        .args(["run", "demo", "--enqueue-only"])
        .assert()
        .success();

    home.command()
        .args(["logs", "--tail", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task_queued"));

    let output = home
        .command()
        .args(["logs", "--tail", "5", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let first_line = String::from_utf8(output).unwrap();
    let event: serde_json::Value =
        serde_json::from_str(first_line.lines().next().unwrap()).unwrap();
    assert_eq!(event["event"], "task_queued");
    assert_eq!(event["task"], "demo");
}

#[test]
fn logs_filter_by_task() {
    let home = TestHome::new();
    home.write_task("one", "task:\n  prompt: a\n");
    home.write_task("two", "task:\n  prompt: b\n");
    home.command().args(["run", "one", "--enqueue-only"]).assert().success();
    home.command().args(["run", "two", "--enqueue-only"]).assert().success();

    home.command()
        .args(["logs", "--tail", "10", "--task", "one"])
        .assert()
        .success()
        .stdout(predicate::str::contains("one").and(predicate::str::contains("two").not()));
}
