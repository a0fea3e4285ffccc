//! Crash testing utilities
//!
//! - Workspace directories holding a config, a log and progress markers
//! - Post-crash validation of the markers file

use std::fs;
use std::path::PathBuf;

use repl_applier::oplog::OperationRecord;
use repl_applier::progress::{FileProgressStore, ProgressMarkers};
use serde_json::json;
use tempfile::TempDir;

/// Records per batch in every crash workspace
pub const BATCH_OPS: usize = 4;

/// A temporary directory with a config, a JSON-lines log of `records`
/// inserts, and (after the first run) a progress markers file.
pub struct Workspace {
    dir: TempDir,
    records: u64,
}

impl Workspace {
    pub fn new(records: u64) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let workspace = Self { dir, records };

        let config = json!({
            "writer_threads": 2,
            "batch_limit_ops": BATCH_OPS,
            "batch_wait_timeout_ms": 10,
            "data_wait_timeout_ms": 5
        });
        fs::write(workspace.config_path(), config.to_string()).expect("Failed to write config");

        let lines: Vec<String> = (1..=records)
            .map(|i| {
                let record = OperationRecord::insert(i, "app.crash", format!("d{}", i))
                    .with_payload(json!({"n": i}));
                serde_json::to_string(&record).expect("Failed to encode record")
            })
            .collect();
        fs::write(workspace.log_path(), lines.join("\n")).expect("Failed to write log");
        workspace
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("repl-applier.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("ops.jsonl")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.path().join("progress.json")
    }

    /// Markers as persisted on disk.
    pub fn markers(&self) -> Result<ProgressMarkers, String> {
        FileProgressStore::read(&self.progress_path()).map_err(|e| e.to_string())
    }
}

/// The markers file must parse, verify its checksum, and never claim more
/// than min-valid covers.
pub fn validate_markers(workspace: &Workspace) -> Result<ProgressMarkers, String> {
    let markers = workspace.markers()?;
    if !markers.applied_through.is_null() && markers.applied_through > markers.min_valid {
        return Err(format!(
            "applied_through {} is past min_valid {}",
            markers.applied_through, markers.min_valid
        ));
    }
    Ok(markers)
}

/// No temporary marker files may survive a completed write.
pub fn validate_no_partial_files(workspace: &Workspace) -> Result<(), String> {
    let tmp = workspace.progress_path().with_extension("tmp");
    if tmp.exists() {
        return Err(format!("Partial file left behind: {}", tmp.display()));
    }
    Ok(())
}
