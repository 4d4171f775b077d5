#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;

/// Per-test home directory with the clodputer layout pre-created.
pub struct TestHome {
    temp: tempfile::TempDir,
}

impl TestHome {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".clodputer/tasks")).expect("tasks dir");
        Self { temp }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join(".clodputer")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir().join("queue.json")
    }

    pub fn execution_log(&self) -> PathBuf {
        self.state_dir().join("execution.log")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir().join("backups")
    }

    /// Writes a task definition under `~/.clodputer/tasks/<name>.yaml`.
    pub fn write_task(&self, name: &str, yaml: &str) {
        fs::write(
            self.state_dir().join("tasks").join(format!("{name}.yaml")),
            yaml,
        )
        .expect("write task");
    }

    /// Writes an executable script and returns its path.
    pub fn write_script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, body).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    /// Installs a `crontab` shim that persists the crontab text under the
    /// test home, and returns the directory to prepend to PATH.
    pub fn install_crontab_shim(&self) -> PathBuf {
        let bin = self.path().join("shim-bin");
        fs::create_dir_all(&bin).expect("shim dir");
        let store = self.path().join("crontab-store");
        let script = format!(
            "#!/bin/sh\n\
             STORE=\"{store}\"\n\
             if [ \"$1\" = \"-l\" ]; then\n\
             \x20\x20[ -f \"$STORE\" ] || exit 1\n\
             \x20\x20cat \"$STORE\"\n\
             \x20\x20exit 0\n\
             fi\n\
             cat > \"$STORE\"\n",
            store = store.display()
        );
        let path = bin.join("crontab");
        fs::write(&path, script).expect("write crontab shim");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        bin
    }

    pub fn crontab_store(&self) -> PathBuf {
        self.path().join("crontab-store")
    }

    /// A command for the clodputer binary scoped to this home. The orphan
    /// sweep is pointed at an inert pattern so tests cannot signal unrelated
    /// host processes.
    pub fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("clodputer").expect("binary");
        cmd.env("HOME", self.path())
            .env("CLODPUTER_ORPHAN_PATTERNS", "clodputer-inert-tool")
            .env_remove("CLODPUTER_CLAUDE_BIN")
            .env_remove("CLODPUTER_EXTRA_ARGS")
            .env_remove("RUST_LOG");
        cmd
    }

    /// Parses the structured execution log into JSON values.
    pub fn log_events(&self) -> Vec<serde_json::Value> {
        match fs::read_to_string(self.execution_log()) {
            Ok(raw) => raw
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Parses the queue state file.
    pub fn queue_state(&self) -> serde_json::Value {
        let raw = fs::read_to_string(self.queue_path()).expect("queue state");
        serde_json::from_str(&raw).expect("queue state parses")
    }

    pub fn events_of_kind(&self, kind: &str) -> Vec<serde_json::Value> {
        self.log_events()
            .into_iter()
            .filter(|event| event["event"] == kind)
            .collect()
    }
}

pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    check()
}
