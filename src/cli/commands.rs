//! CLI command implementations
//!
//! `replay` runs the full apply pipeline (recovery, batcher, orchestrator,
//! worker pool, finalizer) against in-memory storage and a file-backed
//! progress store, so repeated runs resume from the persisted markers.
//! Storage and the local oplog do not outlive a run: on resume they are
//! rebuilt from the log prefix up to applied-through before new records
//! are applied.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::apply::{recover, ApplierConfig, ApplierService, BatchApplicationLock, Collaborators};
use crate::node::{MemoryNodeState, NodeState, NodeStateService};
use crate::observability::{ApplyMetrics, Logger};
use crate::oplog::{LocalOplog, MemoryLogSource, MemoryOplog, OperationRecord};
use crate::progress::{FileProgressStore, MemberProgress, MemoryProgressStore, ProgressStore};
use crate::storage::{ApplyMode, MemoryStorage};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_log, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    Logger::set_min_severity(cli.log_level.into());
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let summary = match cmd {
        Command::Replay {
            config,
            log,
            progress,
            mode,
        } => replay(&config, &log, &progress, mode.into())?,
        Command::Inspect { progress } => inspect(&progress)?,
    };
    write_response(summary)
}

/// Apply every record of `log_path` past the persisted applied-through.
///
/// A missing config file means defaults. Returns the progress summary.
pub fn replay(
    config_path: &Path,
    log_path: &Path,
    progress_path: &Path,
    mode: ApplyMode,
) -> CliResult<Value> {
    let config = if config_path.exists() {
        ApplierConfig::load(config_path)?
    } else {
        ApplierConfig::default()
    };
    config.validate()?;

    let progress = Arc::new(FileProgressStore::open(progress_path)?);
    let resume_after = progress.markers()?.applied_through;
    let (prefix, records): (Vec<_>, Vec<_>) = read_log(log_path)?
        .into_iter()
        .partition(|r| r.op_time <= resume_after);
    let target = records.last().map(|r| r.op_time);
    let count = records.len().to_string();
    Logger::info(
        "CLI_REPLAY_START",
        &[("records", &count), ("resume_after", &resume_after.to_string())],
    );

    let storage = Arc::new(MemoryStorage::new());
    let oplog = Arc::new(MemoryOplog::new());
    rebuild(&config, prefix, &storage, &oplog)?;

    let node = Arc::new(MemoryNodeState::new(NodeState::Startup));
    let metrics = Arc::new(ApplyMetrics::new());
    let parts = Collaborators {
        storage,
        oplog,
        progress: progress.clone(),
        member: Arc::new(MemberProgress::new()),
        node: node.clone(),
        lock: Arc::new(BatchApplicationLock::new()),
        metrics: Arc::clone(&metrics),
        fetcher: None,
    };

    let source = Arc::new(MemoryLogSource::from_records(records));
    let handle = ApplierService::start(config, mode, source, parts)?;
    if let Some(target) = target {
        while !handle.wait_for_applied(target, Duration::from_millis(200)) {
            if handle.is_finished() {
                break;
            }
        }
    }
    let recovery = handle.recovery();
    handle.shutdown()?;

    let markers = progress.markers()?;
    Ok(json!({
        "applied_through": markers.applied_through,
        "min_valid": markers.min_valid,
        "node_state": node.current_state().as_str(),
        "recovery": {
            "truncated": recovery.truncated,
            "replayed": recovery.replayed,
        },
        "metrics": metrics.to_json(),
    }))
}

/// Restore storage and the local oplog to applied-through by replaying
/// `prefix` in recovering mode against scratch progress.
fn rebuild(
    config: &ApplierConfig,
    prefix: Vec<OperationRecord>,
    storage: &Arc<MemoryStorage>,
    oplog: &Arc<MemoryOplog>,
) -> CliResult<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    oplog.append(&prefix)?;
    let scratch = Collaborators {
        storage: storage.clone(),
        oplog: oplog.clone(),
        progress: Arc::new(MemoryProgressStore::new()),
        member: Arc::new(MemberProgress::new()),
        node: Arc::new(MemoryNodeState::new(NodeState::CatchingUp)),
        lock: Arc::new(BatchApplicationLock::new()),
        metrics: Arc::new(ApplyMetrics::new()),
        fetcher: None,
    };
    let report = recover(config, &scratch)?;
    Logger::info(
        "CLI_REPLAY_REBUILD",
        &[
            ("records", &report.replayed.to_string()),
            ("applied_through", &report.applied_through.to_string()),
        ],
    );
    Ok(())
}

/// Read persisted progress markers without modifying them.
pub fn inspect(progress_path: &Path) -> CliResult<Value> {
    if !progress_path.exists() {
        return Err(CliError::io_error(format!(
            "no progress markers at {}",
            progress_path.display()
        )));
    }
    let markers = FileProgressStore::read(progress_path)?;
    Ok(json!({
        "applied_through": markers.applied_through,
        "min_valid": markers.min_valid,
        "truncate_after": markers.truncate_after,
        "started": !markers.applied_through.is_null(),
    }))
}
