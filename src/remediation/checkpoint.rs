//! Emergency checkpoints.
//!
//! A checkpoint is a timestamped directory holding broker positions, working
//! orders and the active configuration, plus a `manifest.json` with the
//! SHA-256 of every file and an aggregate hash over the whole set.
//!
//! ```text
//! checkpoints/checkpoint_20240105T101500123456Z/
//!   positions.json
//!   orders.json
//!   config.yaml
//!   manifest.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{BrokerError, Position, WorkingOrder};
use crate::config::{ConfigError, RemediationConfig};
use crate::state::{write_atomic, StateError};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Broker snapshot failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Config serialization failed: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Write failed: {0}")]
    Write(#[from] StateError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub created_at: DateTime<Utc>,
    /// file name -> sha256 hex
    pub files: BTreeMap<String, String>,
    pub aggregate: String,
}

/// Result of re-hashing a checkpoint directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointVerification {
    pub mismatched: Vec<String>,
    pub missing: Vec<String>,
    /// Files present on disk but absent from the manifest
    pub unexpected: Vec<String>,
    pub aggregate_ok: bool,
}

impl CheckpointVerification {
    pub fn is_intact(&self) -> bool {
        self.aggregate_ok
            && self.mismatched.is_empty()
            && self.missing.is_empty()
            && self.unexpected.is_empty()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash over `name:hash\n` lines in name order.
fn aggregate_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, hash) in files {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn read(path: &Path) -> Result<Vec<u8>, CheckpointError> {
    std::fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a checkpoint under `root` and return its directory.
pub fn write_checkpoint(
    root: &Path,
    positions: &[Position],
    orders: &[WorkingOrder],
    config: &RemediationConfig,
) -> Result<PathBuf, CheckpointError> {
    let created_at = Utc::now();
    let dir = root.join(format!(
        "checkpoint_{}",
        created_at.format("%Y%m%dT%H%M%S%6fZ")
    ));

    let contents = [
        ("positions.json", serde_json::to_vec_pretty(positions)?),
        ("orders.json", serde_json::to_vec_pretty(orders)?),
        ("config.yaml", config.to_yaml()?.into_bytes()),
    ];

    let mut files = BTreeMap::new();
    for (name, bytes) in &contents {
        write_atomic(&dir.join(name), bytes)?;
        files.insert(name.to_string(), sha256_hex(bytes));
    }

    let manifest = CheckpointManifest {
        created_at,
        aggregate: aggregate_hash(&files),
        files,
    };
    write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(&manifest)?,
    )?;

    info!(
        dir = %dir.display(),
        positions = positions.len(),
        orders = orders.len(),
        aggregate = %manifest.aggregate,
        "Emergency checkpoint written"
    );
    Ok(dir)
}

/// Recompute every hash in a checkpoint directory against its manifest.
pub fn verify_checkpoint(dir: &Path) -> Result<CheckpointVerification, CheckpointError> {
    let manifest: CheckpointManifest = serde_json::from_slice(&read(&dir.join(MANIFEST_FILE))?)?;
    let mut report = CheckpointVerification::default();

    let mut actual = BTreeMap::new();
    for (name, expected) in &manifest.files {
        let path = dir.join(name);
        if !path.exists() {
            report.missing.push(name.clone());
            continue;
        }
        let hash = sha256_hex(&read(&path)?);
        if &hash != expected {
            report.mismatched.push(name.clone());
        }
        actual.insert(name.clone(), hash);
    }

    let entries = std::fs::read_dir(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != MANIFEST_FILE && !manifest.files.contains_key(&name) {
            report.unexpected.push(name);
        }
    }
    report.unexpected.sort();

    report.aggregate_ok = report.missing.is_empty()
        && aggregate_hash(&actual) == manifest.aggregate
        && aggregate_hash(&manifest.files) == manifest.aggregate;

    if !report.is_intact() {
        warn!(
            dir = %dir.display(),
            mismatched = ?report.mismatched,
            missing = ?report.missing,
            unexpected = ?report.unexpected,
            "Checkpoint failed verification"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn sample() -> (Vec<Position>, Vec<WorkingOrder>) {
        let positions = vec![Position {
            ticket: 7,
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            volume: dec!(0.5),
            open_price: dec!(1.0850),
            opened_at: Utc::now(),
        }];
        let orders = vec![WorkingOrder {
            ticket: 8,
            symbol: "EURUSD".to_string(),
            side: OrderSide::Sell,
            volume: dec!(0.5),
            price: Some(dec!(1.0900)),
            placed_at: Utc::now(),
        }];
        (positions, orders)
    }

    #[test]
    fn test_fresh_checkpoint_verifies() {
        let root = tempfile::tempdir().unwrap();
        let (positions, orders) = sample();
        let dir = write_checkpoint(root.path(), &positions, &orders, &RemediationConfig::default())
            .unwrap();

        let report = verify_checkpoint(&dir).unwrap();
        assert!(report.is_intact(), "{:?}", report);

        let restored: Vec<Position> =
            serde_json::from_slice(&std::fs::read(dir.join("positions.json")).unwrap()).unwrap();
        assert_eq!(restored, positions);
    }

    #[test]
    fn test_tampering_and_partial_writes_are_detected() {
        let root = tempfile::tempdir().unwrap();
        let (positions, orders) = sample();
        let dir = write_checkpoint(root.path(), &positions, &orders, &RemediationConfig::default())
            .unwrap();

        std::fs::write(dir.join("orders.json"), b"[]").unwrap();
        std::fs::remove_file(dir.join("config.yaml")).unwrap();
        std::fs::write(dir.join("extra.txt"), b"x").unwrap();

        let report = verify_checkpoint(&dir).unwrap();
        assert!(!report.is_intact());
        assert_eq!(report.mismatched, vec!["orders.json"]);
        assert_eq!(report.missing, vec!["config.yaml"]);
        assert_eq!(report.unexpected, vec!["extra.txt"]);
        assert!(!report.aggregate_ok);
    }
}
