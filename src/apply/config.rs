//! Apply engine configuration
//!
//! Loaded from a JSON file; every field has a default so an empty object is
//! a valid configuration. Limits are validated once at load time.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ApplyError, ApplyResult};

/// Apply engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Byte budget per batch. A single oversized record may still form a
    /// batch of one.
    #[serde(default = "default_batch_limit_bytes")]
    pub batch_limit_bytes: usize,

    /// Record count limit per batch.
    #[serde(default = "default_batch_limit_ops")]
    pub batch_limit_ops: usize,

    /// Worker pool size.
    #[serde(default = "default_writer_threads")]
    pub writer_threads: usize,

    /// Records newer than now minus this delay are held back. 0 disables.
    #[serde(default)]
    pub replication_delay_secs: u64,

    /// How long the orchestrator waits for a batch before re-running its
    /// node-state checks.
    #[serde(default = "default_batch_wait_timeout_ms")]
    pub batch_wait_timeout_ms: u64,

    /// How long the batcher blocks on an empty log source per attempt.
    #[serde(default = "default_data_wait_timeout_ms")]
    pub data_wait_timeout_ms: u64,

    /// Maximum container nesting depth.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Attempts at fetching a missing document.
    #[serde(default = "default_missing_document_retries")]
    pub missing_document_retries: u32,

    /// Backoff unit between fetch attempts; attempt k waits k*k units.
    #[serde(default = "default_missing_document_backoff_ms")]
    pub missing_document_backoff_ms: u64,
}

fn default_batch_limit_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_batch_limit_ops() -> usize {
    5000
}
fn default_writer_threads() -> usize {
    16
}
fn default_batch_wait_timeout_ms() -> u64 {
    1000
}
fn default_data_wait_timeout_ms() -> u64 {
    1000
}
fn default_max_nesting_depth() -> usize {
    8
}
fn default_missing_document_retries() -> u32 {
    3
}
fn default_missing_document_backoff_ms() -> u64 {
    1000
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            batch_limit_bytes: default_batch_limit_bytes(),
            batch_limit_ops: default_batch_limit_ops(),
            writer_threads: default_writer_threads(),
            replication_delay_secs: 0,
            batch_wait_timeout_ms: default_batch_wait_timeout_ms(),
            data_wait_timeout_ms: default_data_wait_timeout_ms(),
            max_nesting_depth: default_max_nesting_depth(),
            missing_document_retries: default_missing_document_retries(),
            missing_document_backoff_ms: default_missing_document_backoff_ms(),
        }
    }
}

impl ApplierConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> ApplyResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ApplyError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from JSON text.
    pub fn from_json(content: &str) -> ApplyResult<Self> {
        let config: ApplierConfig = serde_json::from_str(content)
            .map_err(|e| ApplyError::configuration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would stall or disable the engine.
    pub fn validate(&self) -> ApplyResult<()> {
        if self.batch_limit_bytes == 0 {
            return Err(ApplyError::configuration("batch_limit_bytes must be > 0"));
        }
        if self.batch_limit_ops == 0 {
            return Err(ApplyError::configuration("batch_limit_ops must be > 0"));
        }
        if self.writer_threads == 0 {
            return Err(ApplyError::configuration("writer_threads must be > 0"));
        }
        if self.max_nesting_depth == 0 {
            return Err(ApplyError::configuration("max_nesting_depth must be > 0"));
        }
        if self.missing_document_retries == 0 {
            return Err(ApplyError::configuration(
                "missing_document_retries must be > 0",
            ));
        }
        Ok(())
    }

    /// Replication delay, if enabled.
    pub fn replication_delay(&self) -> Option<Duration> {
        if self.replication_delay_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.replication_delay_secs))
        }
    }

    /// Orchestrator wait per batch.
    pub fn batch_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_wait_timeout_ms)
    }

    /// Batcher wait per empty poll.
    pub fn data_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.data_wait_timeout_ms)
    }

    /// Backoff unit for missing-document fetch retries.
    pub fn missing_document_backoff(&self) -> Duration {
        Duration::from_millis(self.missing_document_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ApplierConfig::from_json("{}").unwrap();
        assert_eq!(config, ApplierConfig::default());
        assert_eq!(config.batch_limit_ops, 5000);
        assert_eq!(config.writer_threads, 16);
        assert!(config.replication_delay().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ApplierConfig::from_json(
            r#"{"batch_limit_ops": 10, "writer_threads": 2, "replication_delay_secs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.batch_limit_ops, 10);
        assert_eq!(config.writer_threads, 2);
        assert_eq!(config.replication_delay(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_writers_rejected() {
        let err = ApplierConfig::from_json(r#"{"writer_threads": 0}"#).unwrap_err();
        assert!(err.message.contains("writer_threads"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_zero_nesting_rejected() {
        assert!(ApplierConfig::from_json(r#"{"max_nesting_depth": 0}"#).is_err());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(ApplierConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ApplierConfig::load(Path::new("/nonexistent/applier.json")).unwrap_err();
        assert!(err.message.contains("failed to read"));
    }
}
