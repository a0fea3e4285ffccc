//! Crash test harness for subprocess management
//!
//! Runs `repl-applier replay` against a workspace directory, optionally
//! with a crash point armed, and captures the outcome.

use std::path::Path;
use std::process::{Command, ExitStatus};

use repl_applier::crash_point::CRASH_POINT_ENV;
use serde_json::Value;

use super::utils::Workspace;

/// Result of one replay run
#[derive(Debug)]
pub struct CrashTestResult {
    /// Whether the process exited unsuccessfully
    pub crashed: bool,
    /// Exit status if the process could be started
    pub exit_status: Option<ExitStatus>,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
}

impl CrashTestResult {
    /// The `data` object of the printed response, if the run succeeded.
    ///
    /// Log lines share stdout with the response, which is printed last.
    pub fn summary(&self) -> Option<Value> {
        self.stdout
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(|line| line.get("status").is_some())
            .filter(|response| response["status"] == "ok")
            .map(|response| response["data"].clone())
    }
}

fn binary() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_repl-applier"))
}

/// Replay the workspace log with `crash_point` armed.
pub fn replay_with_crash_point(crash_point: &str, workspace: &Workspace) -> CrashTestResult {
    execute(Some(crash_point), workspace)
}

/// Replay the workspace log with no crash point.
pub fn replay(workspace: &Workspace) -> CrashTestResult {
    execute(None, workspace)
}

fn execute(crash_point: Option<&str>, workspace: &Workspace) -> CrashTestResult {
    let mut command = Command::new(binary());
    command
        .arg("replay")
        .arg("--config")
        .arg(workspace.config_path())
        .arg("--log")
        .arg(workspace.log_path())
        .arg("--progress")
        .arg(workspace.progress_path())
        .env_remove(CRASH_POINT_ENV);
    if let Some(point) = crash_point {
        command.env(CRASH_POINT_ENV, point);
    }

    match command.output() {
        Ok(output) => CrashTestResult {
            crashed: !output.status.success(),
            exit_status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => CrashTestResult {
            crashed: true,
            exit_status: None,
            stdout: String::new(),
            stderr: format!("Failed to execute: {}", e),
        },
    }
}

/// Report crash test failure
pub fn report_failure(crash_point: &str, expected: &str, actual: &str, result: &CrashTestResult) {
    eprintln!("=== CRASH TEST FAILURE ===");
    eprintln!("Crash point: {}", crash_point);
    eprintln!("Expected: {}", expected);
    eprintln!("Actual: {}", actual);
    eprintln!("Exit status: {:?}", result.exit_status);
    eprintln!("Logs:\n{}", result.stderr);
    eprintln!("==========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_replay_succeeds() {
        let workspace = Workspace::new(6);
        let result = replay(&workspace);
        assert!(!result.crashed, "{}", result.stderr);
        let summary = result.summary().unwrap();
        assert_eq!(summary["applied_through"]["seq"], 6);
    }
}
