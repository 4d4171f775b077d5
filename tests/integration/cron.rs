#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::TestHome;
use predicates::prelude::*;

const PRE_EXISTING: &str = "MAILTO=me@example.com\n30 1 * * * /usr/bin/backup --nightly\n";

fn scheduled_home() -> TestHome {
    let home = TestHome::new();
    fs::write(home.crontab_store(), PRE_EXISTING).unwrap();

    home.write_task(
        "morning-brief",
        r#"
trigger:
  type: cron
  expression: "0 9 * * *"
  timezone: America/New_York
task:
  prompt: "Summarize the inbox"
"#,
    );
    home.write_task(
        "hourly-sync",
        r#"
trigger:
  type: interval
  seconds: 3600
task:
  prompt: "Sync"
"#,
    );
    home.write_task(
        "weekly-report",
        r#"
trigger:
  type: cron
  expression: "0 17 * * 5"
task:
  prompt: "Report"
"#,
    );
    home
}

fn backups(home: &TestHome) -> Vec<String> {
    match fs::read_dir(home.backups_dir()) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("crontab-"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn install_twice_and_uninstall_round_trips_byte_identically() {
    let home = scheduled_home();
    let shim = home.install_crontab_shim();
    let path_env = format!("{}:{}", shim.display(), std::env::var("PATH").unwrap());

    home.command()
        .env("PATH", &path_env)
        .arg("install")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 scheduled task(s)"));

    let after_first = fs::read_to_string(home.crontab_store()).unwrap();
    assert!(after_first.starts_with(PRE_EXISTING));
    assert!(after_first.contains("# CLODPUTER_BEGIN"));
    assert!(after_first.contains("# CLODPUTER_END"));
    assert!(after_first.contains("run morning-brief >> "));
    assert!(after_first.contains("CRON_TZ=America/New_York"));
    assert!(after_first.contains("0 */1 * * * "));

    // Second install is idempotent.
    home.command()
        .env("PATH", &path_env)
        .arg("install")
        .assert()
        .success();
    let after_second = fs::read_to_string(home.crontab_store()).unwrap();
    assert_eq!(after_first, after_second);

    // Uninstall restores the pre-existing lines exactly.
    home.command()
        .env("PATH", &path_env)
        .arg("uninstall")
        .assert()
        .success();
    let after_uninstall = fs::read_to_string(home.crontab_store()).unwrap();
    assert_eq!(after_uninstall, PRE_EXISTING);

    // One timestamped backup per write.
    assert_eq!(backups(&home).len(), 3);
}

#[test]
fn dry_run_install_writes_nothing() {
    let home = scheduled_home();
    let shim = home.install_crontab_shim();
    let path_env = format!("{}:{}", shim.display(), std::env::var("PATH").unwrap());

    home.command()
        .env("PATH", &path_env)
        .args(["install", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# CLODPUTER_BEGIN"));

    assert_eq!(fs::read_to_string(home.crontab_store()).unwrap(), PRE_EXISTING);
    assert!(backups(&home).is_empty());
}

#[test]
fn unconvertible_interval_never_reaches_the_crontab() {
    let home = TestHome::new();
    fs::write(home.crontab_store(), PRE_EXISTING).unwrap();
    let shim = home.install_crontab_shim();
    let path_env = format!("{}:{}", shim.display(), std::env::var("PATH").unwrap());

    // 90 minutes is minute-aligned but has no crontab equivalent, so it is
    // rejected when the task file is loaded and never reaches install.
    home.write_task(
        "awkward",
        r#"
trigger:
  type: interval
  seconds: 5400
task:
  prompt: "p"
"#,
    );

    home.command()
        .env("PATH", &path_env)
        .arg("install")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 scheduled task(s)"));
    // The managed block is installed but carries no entries.
    let store = fs::read_to_string(home.crontab_store()).unwrap();
    assert!(store.contains("# CLODPUTER_BEGIN\n# CLODPUTER_END"));
}

#[test]
fn schedule_preview_reports_upcoming_firings() {
    let home = scheduled_home();

    home.command()
        .args(["schedule-preview", "morning-brief", "--count", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Next 3 firing(s)"));

    // Intervals preview through their converted expression.
    home.command()
        .args(["schedule-preview", "hourly-sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 */1 * * *"));

    // A manual-only task has nothing to preview.
    home.write_task("manual-only", "task:\n  prompt: p\n");
    home.command()
        .args(["schedule-preview", "manual-only"])
        .assert()
        .code(1);
}
