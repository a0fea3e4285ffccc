//! Batch application crash scenarios
//!
//! - Crash before min-valid is raised: the truncate-after point survives
//!   and the next start truncates the local log from it
//! - Crash after min-valid but before applied-through: the member stays
//!   inconsistent until it re-applies the batch
//! - Crash after applied-through: the batch is not applied again
//! - In every case a clean rerun reaches the end of the log

use crate::crash::harness::{replay, replay_with_crash_point, report_failure};
use crate::crash::utils::{validate_markers, validate_no_partial_files, Workspace, BATCH_OPS};
use repl_applier::crash_point::points;

const RECORDS: u64 = 10;

fn crash_then_resume(point: &str) -> Workspace {
    let workspace = Workspace::new(RECORDS);

    let crashed = replay_with_crash_point(point, &workspace);
    if !crashed.crashed {
        report_failure(point, "process abort", "clean exit", &crashed);
    }
    assert!(crashed.crashed);
    assert!(crashed.summary().is_none());
    validate_no_partial_files(&workspace).unwrap();

    workspace
}

fn assert_resumes_to_end(point: &str, workspace: &Workspace) {
    let rerun = replay(workspace);
    if rerun.crashed {
        report_failure(point, "clean rerun", "crash", &rerun);
    }
    assert!(!rerun.crashed);

    let summary = rerun.summary().unwrap();
    assert_eq!(summary["node_state"], "caught_up");

    let markers = validate_markers(workspace).unwrap();
    assert_eq!(markers.applied_through.seq, workspace.records());
    assert_eq!(markers.min_valid.seq, workspace.records());
    assert_eq!(markers.truncate_after, None);
    validate_no_partial_files(workspace).unwrap();
}

/// Test: truncate-after point is persisted before the local log write
#[test]
fn test_crash_after_truncate_point() {
    let point = points::APPLY_AFTER_TRUNCATE_POINT;
    let workspace = crash_then_resume(point);

    let markers = validate_markers(&workspace).unwrap();
    assert_eq!(markers.truncate_after, Some(1));
    assert!(markers.applied_through.is_null());
    assert!(markers.min_valid.is_null());

    let rerun = replay(&workspace);
    assert!(!rerun.crashed, "{}", rerun.stderr);
    assert_eq!(rerun.summary().unwrap()["applied_through"]["seq"], RECORDS);
}

/// Test: truncate-after point still covers a written but unconfirmed batch
#[test]
fn test_crash_after_local_oplog_write() {
    let point = points::APPLY_AFTER_LOCAL_OPLOG_WRITE;
    let workspace = crash_then_resume(point);

    let markers = validate_markers(&workspace).unwrap();
    assert_eq!(markers.truncate_after, Some(1));
    assert!(markers.applied_through.is_null());

    assert_resumes_to_end(point, &workspace);
}

/// Test: min-valid covers the batch before any lane runs
#[test]
fn test_crash_after_min_valid() {
    let point = points::APPLY_AFTER_MIN_VALID;
    let workspace = crash_then_resume(point);

    let markers = validate_markers(&workspace).unwrap();
    assert_eq!(markers.truncate_after, None);
    assert_eq!(markers.min_valid.seq, BATCH_OPS as u64);
    assert!(markers.applied_through.is_null());

    assert_resumes_to_end(point, &workspace);
}

/// Test: applied lanes without applied-through are re-applied
#[test]
fn test_crash_after_lanes() {
    let point = points::APPLY_AFTER_LANES;
    let workspace = crash_then_resume(point);

    let markers = validate_markers(&workspace).unwrap();
    assert_eq!(markers.min_valid.seq, BATCH_OPS as u64);
    assert!(markers.applied_through.is_null());

    assert_resumes_to_end(point, &workspace);
}

/// Test: a batch recorded as applied is skipped on resume
#[test]
fn test_crash_after_applied_through() {
    let point = points::APPLY_AFTER_APPLIED_THROUGH;
    let workspace = crash_then_resume(point);

    let markers = validate_markers(&workspace).unwrap();
    assert_eq!(markers.applied_through.seq, BATCH_OPS as u64);
    assert_eq!(markers.min_valid.seq, BATCH_OPS as u64);

    let rerun = replay(&workspace);
    assert!(!rerun.crashed, "{}", rerun.stderr);
    let summary = rerun.summary().unwrap();
    assert_eq!(
        summary["metrics"]["ops_applied"],
        RECORDS - BATCH_OPS as u64
    );
    assert_resumes_to_end(point, &workspace);
}

/// Test: every crash point is covered above
#[test]
fn test_apply_crash_points_defined() {
    assert_eq!(
        points::all(),
        &[
            "apply_after_truncate_point",
            "apply_after_local_oplog_write",
            "apply_after_min_valid",
            "apply_after_lanes",
            "apply_after_applied_through",
        ]
    );
}
