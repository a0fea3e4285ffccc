//! Crash point injection for durability testing
//!
//! Set `REPL_APPLIER_CRASH_POINT` to one of the names in [`points`] and the
//! process aborts when batch application reaches that step. No cleanup, no
//! unwinding.
//!
//! ```bash
//! REPL_APPLIER_CRASH_POINT=apply_after_min_valid repl-applier replay ...
//! ```

use std::sync::OnceLock;

/// Environment variable naming the active crash point.
pub const CRASH_POINT_ENV: &str = "REPL_APPLIER_CRASH_POINT";

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn configured() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var(CRASH_POINT_ENV).ok())
        .as_deref()
}

/// Whether `name` is the configured crash point.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    configured().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if `name` is the configured crash point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// Crash point names, in the order a batch passes them.
pub mod points {
    pub const APPLY_AFTER_TRUNCATE_POINT: &str = "apply_after_truncate_point";
    pub const APPLY_AFTER_LOCAL_OPLOG_WRITE: &str = "apply_after_local_oplog_write";
    pub const APPLY_AFTER_MIN_VALID: &str = "apply_after_min_valid";
    pub const APPLY_AFTER_LANES: &str = "apply_after_lanes";
    pub const APPLY_AFTER_APPLIED_THROUGH: &str = "apply_after_applied_through";

    /// Every crash point.
    pub fn all() -> &'static [&'static str] {
        &[
            APPLY_AFTER_TRUNCATE_POINT,
            APPLY_AFTER_LOCAL_OPLOG_WRITE,
            APPLY_AFTER_MIN_VALID,
            APPLY_AFTER_LANES,
            APPLY_AFTER_APPLIED_THROUGH,
        ]
    }
}
