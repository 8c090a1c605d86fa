//! System mode state machine with atomic persistence.
//!
//! Holds the single process-wide [`SystemMode`]. The mode only changes
//! through [`StateMachine::evaluate`] or [`StateMachine::transition_to`], and
//! every change is written to disk before the call returns so a restart
//! resumes in the mode the process last committed to.
//!
//! # Safety
//! - Uses atomic file writes (write to temp, fsync, rename) for durability
//! - Readers get snapshots via [`StateMachine::current`] or a watch channel,
//!   never a reference into the lock

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::health::{HealthMetric, HealthStatus};
use crate::metrics;

/// More than this many DEGRADED checks degrade the whole system.
const DEGRADED_CHECK_LIMIT: usize = 2;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to persist mode to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode mode record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Overall operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Healthy,
    Degraded,
    Recovering,
    SafeMode,
}

impl SystemMode {
    /// Gauge encoding (0=healthy, 1=recovering, 2=degraded, 3=safe_mode)
    pub fn as_gauge(self) -> f64 {
        match self {
            SystemMode::Healthy => 0.0,
            SystemMode::Recovering => 1.0,
            SystemMode::Degraded => 2.0,
            SystemMode::SafeMode => 3.0,
        }
    }

    fn severity(self) -> u8 {
        match self {
            SystemMode::Healthy => 0,
            SystemMode::Recovering => 1,
            SystemMode::Degraded => 2,
            SystemMode::SafeMode => 3,
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMode::Healthy => write!(f, "HEALTHY"),
            SystemMode::Degraded => write!(f, "DEGRADED"),
            SystemMode::Recovering => write!(f, "RECOVERING"),
            SystemMode::SafeMode => write!(f, "SAFE_MODE"),
        }
    }
}

/// A committed mode change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: SystemMode,
    pub to: SystemMode,
    pub at: DateTime<Utc>,
    pub reason: String,
}

impl ModeTransition {
    /// Moving into DEGRADED or SAFE_MODE from a healthier mode.
    pub fn is_degrading(&self) -> bool {
        matches!(self.to, SystemMode::Degraded | SystemMode::SafeMode)
            && self.to.severity() > self.from.severity()
    }

    /// Reaching HEALTHY from any other mode.
    pub fn is_recovery(&self) -> bool {
        self.to == SystemMode::Healthy && self.from != SystemMode::Healthy
    }
}

/// On-disk record of the last committed mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMode {
    pub mode: SystemMode,
    pub updated_at: DateTime<Utc>,
    pub reason: String,
}

/// Atomic JSON store for the current mode.
#[derive(Debug, Clone)]
pub struct ModeStore {
    path: PathBuf,
}

impl ModeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last committed mode.
    ///
    /// A missing file is `Ok(None)`. A corrupt file is logged and treated as
    /// missing so a bad write cannot keep the process from starting.
    pub fn load(&self) -> Result<Option<PersistedMode>, StateError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        match serde_json::from_str(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt mode file");
                Ok(None)
            }
        }
    }

    /// Persist atomically: write temp file, fsync, rename.
    pub fn save(&self, record: &PersistedMode) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Write-to-temp, fsync, rename. Either the old or the new file is visible
/// after a crash, never a partial one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = fs::File::create(&temp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&temp, path).map_err(io_err)?;
    Ok(())
}

/// Pure aggregation of one tick's metrics into a target mode.
///
/// Any CRITICAL wins. While RECOVERING the mode holds until no check is
/// DEGRADED or CRITICAL. Otherwise more than two DEGRADED checks degrade the
/// system.
pub fn aggregate(current: SystemMode, metrics: &[HealthMetric]) -> SystemMode {
    let critical = metrics
        .iter()
        .filter(|m| m.status == HealthStatus::Critical)
        .count();
    let degraded = metrics
        .iter()
        .filter(|m| m.status == HealthStatus::Degraded)
        .count();

    if critical > 0 {
        SystemMode::SafeMode
    } else if current == SystemMode::Recovering {
        if degraded == 0 {
            SystemMode::Healthy
        } else {
            SystemMode::Recovering
        }
    } else if degraded > DEGRADED_CHECK_LIMIT {
        SystemMode::Degraded
    } else {
        SystemMode::Healthy
    }
}

/// Owner of the process-wide [`SystemMode`].
pub struct StateMachine {
    mode: Mutex<SystemMode>,
    store: Option<ModeStore>,
    tx: watch::Sender<SystemMode>,
}

impl StateMachine {
    /// In-memory state machine starting at `initial`.
    pub fn new(initial: SystemMode) -> Self {
        let (tx, _) = watch::channel(initial);
        metrics::set_system_mode(initial.as_gauge());
        Self {
            mode: Mutex::new(initial),
            store: None,
            tx,
        }
    }

    /// State machine backed by `store`, resuming from its last record.
    pub fn with_store(store: ModeStore) -> Result<Self, StateError> {
        let initial = match store.load()? {
            Some(record) => {
                info!(mode = %record.mode, since = %record.updated_at, "Restored system mode");
                record.mode
            }
            None => SystemMode::Healthy,
        };
        let mut machine = Self::new(initial);
        machine.store = Some(store);
        Ok(machine)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SystemMode> {
        self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current mode.
    pub fn current(&self) -> SystemMode {
        *self.lock()
    }

    /// Receiver that observes every committed mode.
    pub fn subscribe(&self) -> watch::Receiver<SystemMode> {
        self.tx.subscribe()
    }

    /// Aggregate a tick's metrics and commit any resulting transition.
    pub fn evaluate(&self, metrics: &[HealthMetric]) -> Result<Option<ModeTransition>, StateError> {
        let mut guard = self.lock();
        let target = aggregate(*guard, metrics);
        let reason = describe(metrics);
        self.commit(&mut guard, target, reason)
    }

    /// Force a transition (remediation start, escalation).
    pub fn transition_to(
        &self,
        target: SystemMode,
        reason: impl Into<String>,
    ) -> Result<Option<ModeTransition>, StateError> {
        let mut guard = self.lock();
        self.commit(&mut guard, target, reason.into())
    }

    fn commit(
        &self,
        guard: &mut SystemMode,
        target: SystemMode,
        reason: String,
    ) -> Result<Option<ModeTransition>, StateError> {
        if *guard == target {
            return Ok(None);
        }
        let transition = ModeTransition {
            from: *guard,
            to: target,
            at: Utc::now(),
            reason,
        };
        if let Some(store) = &self.store {
            store.save(&PersistedMode {
                mode: target,
                updated_at: transition.at,
                reason: transition.reason.clone(),
            })?;
        }
        *guard = target;
        metrics::set_system_mode(target.as_gauge());
        self.tx.send_replace(target);
        info!(
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "System mode transition"
        );
        Ok(Some(transition))
    }
}

fn describe(metrics: &[HealthMetric]) -> String {
    let unhealthy: Vec<String> = metrics
        .iter()
        .filter(|m| matches!(m.status, HealthStatus::Degraded | HealthStatus::Critical))
        .map(|m| format!("{}={}", m.name, m.status))
        .collect();
    if unhealthy.is_empty() {
        "all checks healthy".to_string()
    } else {
        unhealthy.join(", ")
    }
}
