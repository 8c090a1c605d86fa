//! Manual intervention latch.
//!
//! Once engaged, automated trading stays disabled until an operator removes
//! the latch record (`tradeguard reset-latch`). Nothing in the control loop
//! ever clears it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::state::{write_atomic, StateError};

#[derive(Error, Debug)]
pub enum LatchError {
    #[error("Failed to persist latch record: {0}")]
    Persist(#[from] StateError),

    #[error("Failed to access latch record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt latch record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persisted reason the latch was engaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatchRecord {
    pub engaged_at: DateTime<Utc>,
    pub trigger: String,
    pub reason: String,
}

pub struct ManualLatch {
    path: PathBuf,
    record: Mutex<Option<LatchRecord>>,
}

impl ManualLatch {
    /// Open the latch at `path`, restoring an engaged record left by a
    /// previous run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LatchError> {
        let path = path.into();
        let record = read_record(&path)?;
        if let Some(r) = &record {
            warn!(
                path = %path.display(),
                trigger = %r.trigger,
                engaged_at = %r.engaged_at,
                "Manual latch engaged by a previous run, automated trading stays disabled"
            );
        }
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LatchRecord>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_engaged(&self) -> bool {
        self.lock().is_some()
    }

    pub fn record(&self) -> Option<LatchRecord> {
        self.lock().clone()
    }

    /// Engage and persist. Engaging an engaged latch keeps the first record.
    pub fn engage(
        &self,
        trigger: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<LatchRecord, LatchError> {
        let mut guard = self.lock();
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }
        let record = LatchRecord {
            engaged_at: Utc::now(),
            trigger: trigger.into(),
            reason: reason.into(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&record)?)?;
        error!(
            trigger = %record.trigger,
            reason = %record.reason,
            path = %self.path.display(),
            "MANUAL LATCH ENGAGED - automated trading disabled until operator reset"
        );
        *guard = Some(record.clone());
        Ok(record)
    }

    /// Re-read the record from disk. Returns `true` if an engaged latch was
    /// released externally since the last call.
    ///
    /// An unreadable record keeps the latch engaged.
    pub fn refresh_from_disk(&self) -> bool {
        let mut guard = self.lock();
        if guard.is_none() {
            return false;
        }
        match self.path.try_exists() {
            Ok(false) => {
                info!(path = %self.path.display(), "Manual latch released by operator");
                *guard = None;
                true
            }
            Ok(true) => false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not check latch record");
                false
            }
        }
    }

    /// Operator reset: remove the record at `path`. Returns whether one existed.
    pub fn reset(path: impl AsRef<Path>) -> Result<bool, LatchError> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Manual latch record removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LatchError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Read a latch record. A corrupt record counts as engaged.
pub fn read_record(path: &Path) -> Result<Option<LatchRecord>, LatchError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LatchError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable latch record, treating latch as engaged");
            Ok(Some(LatchRecord {
                engaged_at: Utc::now(),
                trigger: "unknown".to_string(),
                reason: format!("unreadable latch record: {}", e),
            }))
        }
    }
}
