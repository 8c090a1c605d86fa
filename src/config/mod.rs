//! Remediation configuration.
//!
//! One YAML document defines the health checks, breaker scopes, playbooks,
//! transports and storage locations. It is loaded and validated once at
//! start-up; every duration and N-of-M rule is already typed by the time the
//! rest of the crate sees it.
//!
//! ```yaml
//! monitor:
//!   tick_interval: 10s
//! health_checks:
//!   - name: bridge_latency
//!     type: transport_latency
//!     timeout: 5s
//!     thresholds: { multiplier: 3.0, crit_ms: 2000 }
//!     hysteresis: { promote_after: 3_of_5, demote_after: 4_of_5 }
//!     playbook: bridge_recovery
//! playbooks:
//!   bridge_recovery:
//!     max_duration: 5m
//!     steps:
//!       - { name: pause, action: pause-new-commands, timeout: 5s }
//! ```

pub mod duration;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remediation::{RemediationPlaybook, RemediationStep};
use crate::resilience::{BackoffPolicy, BreakerSettings, NOfMRule};
use crate::state::SystemMode;

pub use duration::{format_duration, parse_duration};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid duration: '{0}'. Expected format: 500ms, 30s, 2m, 1h or bare seconds")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Health-check probe implementations available to configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Round-trip latency of the primary transport (ms)
    TransportLatency,
    /// Latency of a broker position query (ms)
    BrokerLatency,
    /// Commands in flight on the bridge
    PendingCommands,
    /// Unacknowledged messages in the store-and-forward buffer
    BufferBacklog,
    /// Age of the last tick for a symbol (ms)
    TickFreshness,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransportLatency => "transport_latency",
            Self::BrokerLatency => "broker_latency",
            Self::PendingCommands => "pending_commands",
            Self::BufferBacklog => "buffer_backlog",
            Self::TickFreshness => "tick_freshness",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "duration", default = "default_tick_interval")]
    pub tick_interval: Duration,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_window_size() -> usize {
    crate::resilience::hysteresis::DEFAULT_WINDOW
}
fn default_ema_alpha() -> f64 {
    crate::resilience::hysteresis::DEFAULT_ALPHA
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            window_size: default_window_size(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Breach when value > baseline * multiplier
    pub multiplier: f64,
    /// Values at or above this are CRITICAL outright
    pub crit_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    pub promote_after: NOfMRule,
    pub demote_after: NOfMRule,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            promote_after: NOfMRule { n: 3, m: 5 },
            demote_after: NOfMRule { n: 4, m: 5 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CheckKind,
    #[serde(with = "duration")]
    pub timeout: Duration,
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub per_symbol: bool,
    /// Playbook run when this check triggers a degrading transition
    #[serde(default)]
    pub playbook: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration")]
    pub recovery_timeout: Duration,
    pub half_open_probe_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let s = BreakerSettings::default();
        Self {
            failure_threshold: s.failure_threshold,
            recovery_timeout: s.recovery_timeout,
            half_open_probe_count: s.half_open_probe_count,
        }
    }
}

impl From<BreakerConfig> for BreakerSettings {
    fn from(c: BreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            recovery_timeout: c.recovery_timeout,
            half_open_probe_count: c.half_open_probe_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerScopes {
    #[serde(default)]
    pub system_wide: BreakerConfig,
    #[serde(default)]
    pub per_symbol: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookConfig {
    #[serde(with = "duration")]
    pub max_duration: Duration,
    pub steps: Vec<RemediationStep>,
}

/// Fallback playbooks for transitions not attributable to a single check.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModePlaybooks {
    #[serde(default)]
    pub degraded: Option<String>,
    #[serde(default)]
    pub safe_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Socket,
    Spool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEndpoint {
    pub name: String,
    pub kind: EndpointKind,
    /// `host:port` for socket endpoints
    #[serde(default)]
    pub address: Option<String>,
    /// Spool root for file endpoints (`outbound/`, `inbound/`, `processed/`)
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(with = "duration", default = "default_recovery_base")]
    pub base: Duration,
    #[serde(with = "duration", default = "default_recovery_cap")]
    pub cap: Duration,
    /// Pause between checks while the preferred transport is primary
    #[serde(with = "duration", default = "default_recovery_interval")]
    pub interval: Duration,
}

fn default_recovery_base() -> Duration {
    Duration::from_secs(1)
}
fn default_recovery_cap() -> Duration {
    Duration::from_secs(60)
}
fn default_recovery_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base: default_recovery_base(),
            cap: default_recovery_cap(),
            interval: default_recovery_interval(),
        }
    }
}

impl RecoveryConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportsConfig {
    #[serde(default)]
    pub endpoints: Vec<TransportEndpoint>,
    /// Transport to restore as primary whenever it is meaningfully faster
    #[serde(default)]
    pub preferred: Option<String>,
    #[serde(with = "duration", default = "default_send_timeout")]
    pub send_timeout: Duration,
    /// Candidate must measure below `ratio * current` latency to take over
    #[serde(default = "default_latency_improvement")]
    pub latency_improvement: f64,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_latency_improvement() -> f64 {
    0.8
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            preferred: None,
            send_timeout: default_send_timeout(),
            latency_improvement: default_latency_improvement(),
            recovery: RecoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,
    #[serde(with = "duration", default = "default_buffer_ttl")]
    pub ttl: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "duration", default = "default_replay_interval")]
    pub replay_interval: Duration,
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("tradeguard_buffer.db")
}
fn default_buffer_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_batch_size() -> usize {
    100
}
fn default_replay_interval() -> Duration {
    Duration::from_secs(15)
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
            ttl: default_buffer_ttl(),
            batch_size: default_batch_size(),
            replay_interval: default_replay_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationSettings {
    #[serde(with = "duration", default = "default_quiesce_timeout")]
    pub quiesce_timeout: Duration,
    /// Slippage cap for graceful closes, in price units
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    /// Fraction of positions that must close gracefully
    #[serde(default = "default_graceful_close_ratio")]
    pub graceful_close_ratio: f64,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_latch_path")]
    pub latch_path: PathBuf,
    #[serde(default = "default_alert_channels")]
    pub alert_channels: Vec<String>,
    /// Recovery records kept by the orchestrator
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Position drift (in lots) that halts a symbol during reconciliation
    #[serde(default = "default_halt_threshold")]
    pub reconcile_halt_threshold: Decimal,
}

fn default_quiesce_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_slippage() -> Decimal {
    Decimal::new(5, 4) // 0.0005
}
fn default_graceful_close_ratio() -> f64 {
    0.8
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_latch_path() -> PathBuf {
    PathBuf::from("manual_latch.json")
}
fn default_alert_channels() -> Vec<String> {
    vec!["log".to_string()]
}
fn default_history_limit() -> usize {
    50
}
fn default_halt_threshold() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

impl Default for RemediationSettings {
    fn default() -> Self {
        Self {
            quiesce_timeout: default_quiesce_timeout(),
            max_slippage: default_max_slippage(),
            graceful_close_ratio: default_graceful_close_ratio(),
            checkpoint_dir: default_checkpoint_dir(),
            latch_path: default_latch_path(),
            alert_channels: default_alert_channels(),
            history_limit: default_history_limit(),
            reconcile_halt_threshold: default_halt_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_mode_path")]
    pub mode_path: PathBuf,
}

fn default_mode_path() -> PathBuf {
    PathBuf::from("system_mode.json")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            mode_path: default_mode_path(),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Symbols that per-symbol checks are replicated over
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckConfig>,
    #[serde(default)]
    pub breakers: BreakerScopes,
    #[serde(default)]
    pub playbooks: BTreeMap<String, PlaybookConfig>,
    #[serde(default)]
    pub mode_playbooks: ModePlaybooks,
    #[serde(default)]
    pub transports: TransportsConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub remediation: RemediationSettings,
    #[serde(default)]
    pub state: StateConfig,
}

impl RemediationConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RemediationConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolve a named playbook.
    pub fn playbook(&self, name: &str) -> Option<RemediationPlaybook> {
        self.playbooks.get(name).map(|p| RemediationPlaybook {
            name: name.to_string(),
            max_duration: p.max_duration,
            steps: p.steps.clone(),
        })
    }

    /// Fallback playbook name for a degrading mode.
    pub fn mode_playbook(&self, mode: SystemMode) -> Option<&str> {
        match mode {
            SystemMode::Degraded => self.mode_playbooks.degraded.as_deref(),
            SystemMode::SafeMode => self.mode_playbooks.safe_mode.as_deref(),
            SystemMode::Healthy | SystemMode::Recovering => None,
        }
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheckConfig> {
        self.health_checks.iter().find(|c| c.name == name)
    }

    /// Cross-reference and range checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.monitor.tick_interval.is_zero() {
            return invalid("monitor.tick_interval must be positive".into());
        }
        if !(self.monitor.ema_alpha > 0.0 && self.monitor.ema_alpha <= 1.0) {
            return invalid(format!(
                "monitor.ema_alpha must be in (0, 1], got {}",
                self.monitor.ema_alpha
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for check in &self.health_checks {
            if !seen.insert(check.name.as_str()) {
                return invalid(format!("duplicate health check '{}'", check.name));
            }
            if check.timeout.is_zero() {
                return invalid(format!("check '{}': timeout must be positive", check.name));
            }
            if check.thresholds.multiplier <= 0.0 || check.thresholds.crit_ms <= 0.0 {
                return invalid(format!(
                    "check '{}': thresholds must be positive",
                    check.name
                ));
            }
            let widest = check
                .hysteresis
                .promote_after
                .m
                .max(check.hysteresis.demote_after.m);
            if widest > self.monitor.window_size {
                return invalid(format!(
                    "check '{}': hysteresis rule spans {} samples but window_size is {}",
                    check.name, widest, self.monitor.window_size
                ));
            }
            if check.per_symbol && self.symbols.is_empty() {
                return invalid(format!(
                    "check '{}' is per_symbol but no symbols are configured",
                    check.name
                ));
            }
            if let Some(pb) = &check.playbook {
                if !self.playbooks.contains_key(pb) {
                    return invalid(format!(
                        "check '{}' references unknown playbook '{}'",
                        check.name, pb
                    ));
                }
            }
        }

        for pb in [&self.mode_playbooks.degraded, &self.mode_playbooks.safe_mode]
            .into_iter()
            .flatten()
        {
            if !self.playbooks.contains_key(pb) {
                return invalid(format!("mode_playbooks references unknown playbook '{}'", pb));
            }
        }

        for (name, pb) in &self.playbooks {
            if pb.max_duration.is_zero() {
                return invalid(format!("playbook '{}': max_duration must be positive", name));
            }
            if pb.steps.is_empty() {
                return invalid(format!("playbook '{}' has no steps", name));
            }
            if let Some(step) = pb.steps.iter().find(|s| s.timeout.is_zero()) {
                return invalid(format!(
                    "playbook '{}' step '{}': timeout must be positive",
                    name, step.name
                ));
            }
        }

        for breaker in [self.breakers.system_wide, self.breakers.per_symbol] {
            if breaker.failure_threshold == 0 || breaker.half_open_probe_count == 0 {
                return invalid("breaker thresholds must be at least 1".into());
            }
        }

        let mut names = std::collections::HashSet::new();
        for ep in &self.transports.endpoints {
            if !names.insert(ep.name.as_str()) {
                return invalid(format!("duplicate transport '{}'", ep.name));
            }
            match ep.kind {
                EndpointKind::Socket if ep.address.is_none() => {
                    return invalid(format!("socket transport '{}' needs an address", ep.name));
                }
                EndpointKind::Spool if ep.root.is_none() => {
                    return invalid(format!("spool transport '{}' needs a root", ep.name));
                }
                _ => {}
            }
        }
        if let Some(preferred) = &self.transports.preferred {
            if !names.contains(preferred.as_str()) {
                return invalid(format!("preferred transport '{}' is not defined", preferred));
            }
        }
        if !(self.transports.latency_improvement > 0.0 && self.transports.latency_improvement <= 1.0)
        {
            return invalid("transports.latency_improvement must be in (0, 1]".into());
        }

        if self.buffer.batch_size == 0 {
            return invalid("buffer.batch_size must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.remediation.graceful_close_ratio) {
            return invalid("remediation.graceful_close_ratio must be in [0, 1]".into());
        }

        Ok(())
    }
}
