#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{TestHome, pid_alive, wait_until};
use predicates::prelude::*;

#[test]
fn happy_path_records_success_end_to_end() {
    let home = TestHome::new();
    home.write_task(
        "demo",
        r#"
task:
  prompt: "echo-json"
  timeout_secs: 10
"#,
    );
    let fake = home.write_script(
        "fake-assistant.sh",
        "#!/bin/sh\ncat > /dev/null\necho '{\"result\": \"done\", \"is_error\": false}'\n",
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("success"));

    assert_eq!(home.events_of_kind("task_started").len(), 1);
    let completed = home.events_of_kind("task_completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["details"]["outcome"], "success");
    assert_eq!(completed[0]["details"]["payload"]["result"], "done");

    let state = home.queue_state();
    assert!(state["pending"].as_array().unwrap().is_empty());
    assert!(state["running"].is_null());
    let ring = state["completed_recent"].as_array().unwrap();
    assert_eq!(ring.len(), 1);
    assert_eq!(ring[0]["status"], "success");
}

#[test]
fn timeout_terminates_the_whole_process_tree() {
    let home = TestHome::new();
    home.write_task(
        "hang",
        r#"
task:
  prompt: "hang"
  timeout_secs: 2
"#,
    );
    // The assistant forks a 60s sleeper, records its pid, and waits. A
    // naive kill of the leader would leave the sleeper running.
    let child_pid_file = home.path().join("child.pid");
    let fake = home.write_script(
        "fake-assistant.sh",
        &format!(
            "#!/bin/sh\ncat > /dev/null\nsleep 60 &\necho $! > \"{pidfile}\"\nwait\n",
            pidfile = child_pid_file.display()
        ),
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "hang"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(2);

    assert_eq!(home.events_of_kind("task_timeout").len(), 1);
    assert!(!home.events_of_kind("cleanup_signal").is_empty());

    let ring = home.queue_state()["completed_recent"].clone();
    assert_eq!(ring[0]["status"], "timeout");

    // Nothing from the group survives cleanup.
    let sleeper: u32 = fs::read_to_string(&child_pid_file)
        .expect("sleeper pid recorded")
        .trim()
        .parse()
        .expect("pid parses");
    assert!(
        wait_until(Duration::from_secs(5), || !pid_alive(sleeper)),
        "forked sleeper {sleeper} is still alive"
    );
}

#[test]
fn nonzero_exit_without_json_is_an_exit_failure() {
    let home = TestHome::new();
    home.write_task(
        "broken",
        r#"
task:
  prompt: "broken"
  timeout_secs: 10
"#,
    );
    let fake = home.write_script(
        "fake-assistant.sh",
        "#!/bin/sh\ncat > /dev/null\necho 'something went wrong' >&2\nexit 3\n",
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "broken"])
        .assert()
        .code(2);

    let failed = home.events_of_kind("task_failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["details"]["error"], "exit");
    assert_eq!(failed[0]["details"]["exit_code"], 3);
}

#[test]
fn zero_exit_with_plain_text_is_a_parse_failure() {
    let home = TestHome::new();
    home.write_task(
        "chatty",
        r#"
task:
  prompt: "chatty"
  timeout_secs: 10
"#,
    );
    let fake = home.write_script(
        "fake-assistant.sh",
        "#!/bin/sh\ncat > /dev/null\necho 'this is not JSON'\n",
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "chatty"])
        .assert()
        .code(2);

    let failed = home.events_of_kind("task_failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["details"]["error"], "parse");
    // The raw output is preserved for inspection.
    assert!(
        failed[0]["details"]["message"]
            .as_str()
            .unwrap()
            .contains("this is not JSON")
    );
}

#[test]
fn retriable_failure_is_reattempted_with_incremented_attempt() {
    let home = TestHome::new();
    home.write_task(
        "flaky",
        r#"
max_retries: 1
retry_backoff_seconds: 0
task:
  prompt: "flaky"
  timeout_secs: 10
"#,
    );
    // Fails on the first invocation, succeeds on the second.
    let marker = home.path().join("attempted");
    let fake = home.write_script(
        "fake-assistant.sh",
        &format!(
            "#!/bin/sh\ncat > /dev/null\n\
             if [ -f \"{marker}\" ]; then\n\
             \x20\x20echo '{{\"result\": \"recovered\"}}'\n\
             else\n\
             \x20\x20touch \"{marker}\"\n\
             \x20\x20exit 1\nfi\n",
            marker = marker.display()
        ),
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "flaky"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(2); // the first item failed; the retry copy succeeded

    assert_eq!(home.events_of_kind("task_failed").len(), 1);
    assert_eq!(home.events_of_kind("task_completed").len(), 1);
    assert_eq!(home.events_of_kind("task_started").len(), 2);

    let state = home.queue_state();
    let ring = state["completed_recent"].as_array().unwrap();
    assert_eq!(ring.len(), 2);
    assert_eq!(ring[0]["status"], "failure");
    assert_eq!(ring[1]["status"], "success");
    assert!(state["pending"].as_array().unwrap().is_empty());

    // task_started events carry the attempt counter.
    let started = home.events_of_kind("task_started");
    assert_eq!(started[0]["details"]["attempt"], 0);
    assert_eq!(started[1]["details"]["attempt"], 1);
}

#[test]
fn on_failure_handlers_append_to_the_terminal_event() {
    let home = TestHome::new();
    home.write_task(
        "handled",
        r#"
task:
  prompt: "handled"
  timeout_secs: 10
  context:
    WHO: ops
on_failure:
  - type: log
    message: "alerting {{ context.WHO }}"
"#,
    );
    let fake = home.write_script(
        "fake-assistant.sh",
        "#!/bin/sh\ncat > /dev/null\nexit 1\n",
    );

    home.command()
        .env("CLODPUTER_CLAUDE_BIN", &fake)
        .args(["run", "handled"])
        .assert()
        .code(2);

    let failed = home.events_of_kind("task_failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["details"]["handler_log"][0], "alerting ops");
}
