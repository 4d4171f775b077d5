#[path = "common/mod.rs"]
mod common;

use common::TestHome;
use predicates::prelude::*;

const ECHO_TASK: &str = r#"
task:
  prompt: "NAME"
  timeout_secs: 10
"#;

fn task_with_prompt(prompt: &str) -> String {
    ECHO_TASK.replace("NAME", prompt)
}

#[test]
fn enqueue_only_leaves_the_item_pending() {
    let home = TestHome::new();
    home.write_task("demo", &task_with_prompt("demo prompt"));

    home.command()
        .args(["run", "demo", "--enqueue-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued 'demo'"));

    let state = home.queue_state();
    assert_eq!(state["pending"].as_array().unwrap().len(), 1);
    assert_eq!(state["pending"][0]["task_name"], "demo");
    assert_eq!(state["pending"][0]["source"], "manual");
    assert!(state["running"].is_null());

    // One task_queued event, no task_started.
    assert_eq!(home.events_of_kind("task_queued").len(), 1);
    assert!(home.events_of_kind("task_started").is_empty());
}

#[test]
fn queue_command_lists_and_clears_pending_items() {
    let home = TestHome::new();
    home.write_task("first", &task_with_prompt("first"));
    home.write_task("second", &task_with_prompt("second"));

    home.command()
        .args(["run", "first", "--enqueue-only"])
        .assert()
        .success();
    home.command()
        .args(["run", "second", "--enqueue-only"])
        .assert()
        .success();

    home.command()
        .arg("queue")
        .assert()
        .success()
        .stdout(predicate::str::contains("'first'").and(predicate::str::contains("'second'")));

    home.command()
        .args(["queue", "--clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 2 pending item(s)"));

    let state = home.queue_state();
    assert!(state["pending"].as_array().unwrap().is_empty());
}

#[test]
fn unknown_task_is_a_validation_error() {
    let home = TestHome::new();
    home.command()
        .args(["run", "missing"])
        .assert()
        .code(1);
}

#[test]
fn high_priority_items_dispatch_before_earlier_normal_items() {
    let home = TestHome::new();
    // Each task's prompt is its own name; the fake assistant appends the
    // prompt it receives to a file, recording dispatch order.
    for name in ["a", "b", "c"] {
        home.write_task(name, &task_with_prompt(name));
    }
    let ran = home.path().join("ran.txt");
    let fake = home.write_script(
        "fake-assistant.sh",
        &format!(
            "#!/bin/sh\ncat >> \"{ran}\"\necho >> \"{ran}\"\necho '{{\"result\": \"ok\"}}'\n",
            ran = ran.display()
        ),
    );

    home.command()
        .args(["run", "a", "--enqueue-only"])
        .assert()
        .success();
    home.command()
        .args(["run", "b", "--enqueue-only"])
        .assert()
        .success();

    // Pending order after the high enqueue is c, a, b.
    home.command()
        .args(["run", "c", "--priority", "high", "--enqueue-only"])
        .assert()
        .success();
    let state = home.queue_state();
    let order: Vec<&str> = state["pending"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["task_name"].as_str().unwrap())
        .collect();
    assert_eq!(order, ["c", "a", "b"]);

    // Draining executes in that order.
    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "c"])
        .assert()
        .success();

    let recorded = std::fs::read_to_string(&ran).unwrap();
    let ran_order: Vec<&str> = recorded.lines().collect();
    // "c" appears twice: once for the pre-queued item, once for the run.
    assert_eq!(ran_order, ["c", "c", "a", "b"]);

    let state = home.queue_state();
    assert!(state["pending"].as_array().unwrap().is_empty());
    assert!(state["running"].is_null());
    assert_eq!(state["completed_recent"].as_array().unwrap().len(), 4);
}
