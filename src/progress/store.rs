//! Crash-durable progress markers
//!
//! - applied-through: every record at or below it is applied
//! - min-valid: state below it is consistent for external reads
//! - truncate-after point: start of a batch whose local log write may be
//!   partial; recovery discards everything from it onward
//!
//! applied-through and min-valid are compare-and-advance: a lower value is
//! ignored, never written.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::errors::{ProgressError, ProgressResult};
use crate::oplog::OpTime;

/// Persisted marker values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarkers {
    /// Highest OpTime guaranteed applied
    pub applied_through: OpTime,
    /// Boundary below which local state is consistent
    pub min_valid: OpTime,
    /// Sequence number recovery truncates from, if a batch write is in flight
    pub truncate_after: Option<u64>,
}

/// Progress marker storage. Every setter is durable on return.
pub trait ProgressStore: Send + Sync {
    /// Current markers.
    fn markers(&self) -> ProgressResult<ProgressMarkers>;

    /// Advance applied-through. Lower values are ignored.
    fn set_applied_through(&self, at: OpTime) -> ProgressResult<()>;

    /// Advance min-valid. Lower values are ignored.
    fn set_min_valid(&self, at: OpTime) -> ProgressResult<()>;

    /// Set or clear the truncate-after point.
    fn set_truncate_after_point(&self, seq: Option<u64>) -> ProgressResult<()>;
}

fn advance(markers: &mut ProgressMarkers, applied: Option<OpTime>, min_valid: Option<OpTime>) -> bool {
    let mut changed = false;
    if let Some(at) = applied {
        if at > markers.applied_through {
            markers.applied_through = at;
            changed = true;
        }
    }
    if let Some(at) = min_valid {
        if at > markers.min_valid {
            markers.min_valid = at;
            changed = true;
        }
    }
    changed
}

/// Progress markers held in memory.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    markers: Mutex<ProgressMarkers>,
}

impl MemoryProgressStore {
    /// Create a store with null markers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given markers.
    pub fn with_markers(markers: ProgressMarkers) -> Self {
        Self {
            markers: Mutex::new(markers),
        }
    }
}

impl ProgressStore for MemoryProgressStore {
    fn markers(&self) -> ProgressResult<ProgressMarkers> {
        Ok(*self.markers.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_applied_through(&self, at: OpTime) -> ProgressResult<()> {
        let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        advance(&mut markers, Some(at), None);
        Ok(())
    }

    fn set_min_valid(&self, at: OpTime) -> ProgressResult<()> {
        let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        advance(&mut markers, None, Some(at));
        Ok(())
    }

    fn set_truncate_after_point(&self, seq: Option<u64>) -> ProgressResult<()> {
        self.markers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .truncate_after = seq;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkersFile {
    markers: ProgressMarkers,
    checksum: u32,
}

fn checksum(markers: &ProgressMarkers) -> ProgressResult<u32> {
    let bytes = serde_json::to_vec(markers).map_err(|e| ProgressError::Malformed(e.to_string()))?;
    Ok(crc32fast::hash(&bytes))
}

/// Progress markers persisted to a JSON file.
///
/// Writes go to a temporary sibling which is fsynced and renamed over the
/// markers file, so a crash leaves either the old or the new markers.
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    markers: Mutex<ProgressMarkers>,
}

impl FileProgressStore {
    /// Open the markers file, creating null markers if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> ProgressResult<Self> {
        let path = path.into();
        let markers = if path.exists() {
            Self::read(&path)?
        } else {
            let markers = ProgressMarkers::default();
            Self::write(&path, &markers)?;
            markers
        };
        Ok(Self {
            path,
            markers: Mutex::new(markers),
        })
    }

    /// Path of the markers file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and verify a markers file.
    pub fn read(path: &Path) -> ProgressResult<ProgressMarkers> {
        let content = fs::read(path)?;
        let file: MarkersFile = serde_json::from_slice(&content)
            .map_err(|e| ProgressError::Malformed(e.to_string()))?;
        let found = checksum(&file.markers)?;
        if found != file.checksum {
            return Err(ProgressError::Corrupt {
                expected: file.checksum,
                found,
            });
        }
        Ok(file.markers)
    }

    fn write(path: &Path, markers: &ProgressMarkers) -> ProgressResult<()> {
        let file = MarkersFile {
            markers: *markers,
            checksum: checksum(markers)?,
        };
        let bytes =
            serde_json::to_vec_pretty(&file).map_err(|e| ProgressError::Malformed(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        {
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut ProgressMarkers) -> bool) -> ProgressResult<()> {
        let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = *markers;
        if change(&mut next) {
            Self::write(&self.path, &next)?;
            *markers = next;
        }
        Ok(())
    }
}

impl ProgressStore for FileProgressStore {
    fn markers(&self) -> ProgressResult<ProgressMarkers> {
        Ok(*self.markers.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_applied_through(&self, at: OpTime) -> ProgressResult<()> {
        self.update(|m| advance(m, Some(at), None))
    }

    fn set_min_valid(&self, at: OpTime) -> ProgressResult<()> {
        self.update(|m| advance(m, None, Some(at)))
    }

    fn set_truncate_after_point(&self, seq: Option<u64>) -> ProgressResult<()> {
        self.update(|m| {
            let changed = m.truncate_after != seq;
            m.truncate_after = seq;
            changed
        })
    }
}
