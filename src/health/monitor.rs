//! Per-tick health evaluation.
//!
//! Every configured check runs once per tick, in configuration order, each
//! through its own circuit breaker and hysteresis evaluator:
//!
//! 1. breaker open: CRITICAL is synthesized and the probe is not called
//! 2. probe error or timeout: a failure sample (and a breaker failure)
//! 3. value `>= crit_ms`: CRITICAL
//! 4. otherwise the sample is a success unless it breaches
//!    `baseline * multiplier`, and the N-of-M decision moves the status

use chrono::Utc;
use tracing::{debug, warn};

use super::{CheckError, HealthMetric, HealthProbe, HealthStatus, ProbeSet};
use crate::config::{ConfigError, HealthCheckConfig, RemediationConfig};
use crate::metrics;
use crate::resilience::{
    BreakerError, CircuitBreaker, CircuitState, HysteresisDecision, HysteresisEvaluator,
};
use std::sync::Arc;

struct CheckSlot {
    name: String,
    symbol: Option<String>,
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    breaker: CircuitBreaker,
    evaluator: HysteresisEvaluator,
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl CheckSlot {
    fn record(&mut self, success: bool) {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }
    }

    fn apply(&mut self, decision: HysteresisDecision) {
        self.status = match (decision, self.status) {
            (HysteresisDecision::Promote, _) => HealthStatus::Degraded,
            (HysteresisDecision::Demote, _) => HealthStatus::Healthy,
            (HysteresisDecision::NoChange, HealthStatus::Critical) => HealthStatus::Recovering,
            (HysteresisDecision::NoChange, prior) => prior,
        };
    }

    fn metric(&self, value: f64) -> HealthMetric {
        HealthMetric {
            name: self.name.clone(),
            status: self.status,
            value,
            timestamp: Utc::now(),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }

    async fn run(&mut self) -> HealthMetric {
        let timeout = self.config.timeout;
        let probe = Arc::clone(&self.probe);
        let symbol = self.symbol.clone();
        let check = self.name.clone();

        let result = self
            .breaker
            .call(|| async move {
                tokio::time::timeout(timeout, probe.probe(symbol.as_deref()))
                    .await
                    .unwrap_or_else(|_| {
                        Err(CheckError::Timeout {
                            check,
                            after: timeout,
                        })
                    })
            })
            .await;

        let rules = self.config.hysteresis;
        let value = match result {
            Err(BreakerError::Open { .. }) => {
                self.record(false);
                self.status = HealthStatus::Critical;
                debug!(check = %self.name, "Breaker open, check reported CRITICAL without probing");
                f64::NAN
            }
            Err(BreakerError::Inner(e)) => {
                self.record(false);
                let decision =
                    self.evaluator
                        .evaluate_n_of_m(false, rules.promote_after, rules.demote_after);
                self.apply(decision);
                warn!(check = %self.name, kind = %e.kind(), error = %e, "Health check failed");
                f64::NAN
            }
            Ok(value) if value >= self.config.thresholds.crit_ms => {
                self.record(false);
                self.evaluator
                    .evaluate_n_of_m(false, rules.promote_after, rules.demote_after);
                self.evaluator.update_baseline(value);
                self.status = HealthStatus::Critical;
                warn!(
                    check = %self.name,
                    value,
                    crit = self.config.thresholds.crit_ms,
                    "Health check value at critical level"
                );
                value
            }
            Ok(value) => {
                let breached = self
                    .evaluator
                    .evaluate_threshold(value, self.config.thresholds.multiplier);
                self.evaluator.update_baseline(value);
                self.record(!breached);
                let decision =
                    self.evaluator
                        .evaluate_n_of_m(!breached, rules.promote_after, rules.demote_after);
                self.apply(decision);
                value
            }
        };

        metrics::set_check_status(&self.name, self.status.as_gauge());
        debug!(
            check = %self.name,
            status = %self.status,
            value,
            baseline = ?self.evaluator.baseline(),
            "Health check evaluated"
        );
        self.metric(value)
    }
}

/// Runs the configured checks and keeps their per-check state.
pub struct HealthMonitor {
    slots: Vec<CheckSlot>,
    last: Vec<HealthMetric>,
}

impl HealthMonitor {
    /// Build one slot per check (one per symbol for per-symbol checks).
    pub fn new(config: &RemediationConfig, probes: &ProbeSet) -> Result<Self, ConfigError> {
        let mut slots = Vec::new();
        for check in &config.health_checks {
            let probe = probes.get(check.kind).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "no probe available for check '{}' of type {}",
                    check.name, check.kind
                ))
            })?;
            let capacity = config
                .monitor
                .window_size
                .max(check.hysteresis.promote_after.m)
                .max(check.hysteresis.demote_after.m);

            let targets: Vec<Option<String>> = if check.per_symbol {
                config.symbols.iter().cloned().map(Some).collect()
            } else {
                vec![None]
            };
            let breaker_settings = if check.per_symbol {
                config.breakers.per_symbol
            } else {
                config.breakers.system_wide
            };

            for symbol in targets {
                let name = match &symbol {
                    Some(s) => format!("{}:{}", check.name, s),
                    None => check.name.clone(),
                };
                slots.push(CheckSlot {
                    breaker: CircuitBreaker::new(format!("check:{}", name), breaker_settings.into()),
                    evaluator: HysteresisEvaluator::new(capacity, config.monitor.ema_alpha),
                    name,
                    symbol,
                    config: check.clone(),
                    probe: Arc::clone(&probe),
                    status: HealthStatus::Healthy,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                });
            }
        }
        Ok(Self {
            slots,
            last: Vec::new(),
        })
    }

    /// Run every check once, in configured order.
    pub async fn run_tick(&mut self) -> Vec<HealthMetric> {
        let mut metrics = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            metrics.push(slot.run().await);
        }
        self.last = metrics.clone();
        metrics
    }

    /// Metrics from the most recent tick.
    pub fn last_metrics(&self) -> &[HealthMetric] {
        &self.last
    }

    /// Configuration of the check that produced `metric_name`.
    pub fn check_config(&self, metric_name: &str) -> Option<&HealthCheckConfig> {
        self.slots
            .iter()
            .find(|s| s.name == metric_name)
            .map(|s| &s.config)
    }

    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.breaker.get_state()))
            .collect()
    }

    pub fn check_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a scripted sequence of probe results.
    struct Scripted {
        values: Mutex<Vec<Option<f64>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(values: Vec<Option<f64>>) -> Arc<Self> {
            let mut values = values;
            values.reverse();
            Arc::new(Self {
                values: Mutex::new(values),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for Arc<Scripted> {
        async fn probe(&self, _symbol: Option<&str>) -> Result<f64, CheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.values.lock().unwrap().pop().flatten() {
                Some(v) => Ok(v),
                None => Err(CheckError::MissingSymbol),
            }
        }
    }

    fn config(yaml_extra: &str) -> RemediationConfig {
        let yaml = format!(
            r#"
symbols: [EURUSD, XAUUSD]
health_checks:
  - name: latency
    type: transport_latency
    timeout: 1s
    thresholds: {{ multiplier: 3.0, crit_ms: 1000 }}
    hysteresis: {{ promote_after: 3_of_5, demote_after: 4_of_5 }}
{}
breakers:
  system_wide: {{ failure_threshold: 2, recovery_timeout: 60s, half_open_probe_count: 1 }}
"#,
            yaml_extra
        );
        RemediationConfig::from_yaml_str(&yaml).unwrap()
    }

    fn monitor(config: &RemediationConfig, probe: Arc<Scripted>) -> HealthMonitor {
        let probes = ProbeSet::new()
            .with(CheckKind::TransportLatency, Arc::clone(&probe))
            .with(CheckKind::TickFreshness, probe);
        HealthMonitor::new(config, &probes).unwrap()
    }

    #[tokio::test]
    async fn test_sustained_breach_degrades_after_hysteresis() {
        let config = config("");
        // Baseline settles at 10ms, then every sample breaches 3x
        let mut script = vec![Some(10.0); 5];
        script.extend(vec![Some(100.0); 3]);
        let probe = Scripted::new(script);
        let mut monitor = monitor(&config, probe);

        for _ in 0..5 {
            let m = monitor.run_tick().await;
            assert_eq!(m[0].status, HealthStatus::Healthy);
        }
        // One and two breaches: not yet 3 of 5
        assert_eq!(monitor.run_tick().await[0].status, HealthStatus::Healthy);
        assert_eq!(monitor.run_tick().await[0].status, HealthStatus::Healthy);
        let m = monitor.run_tick().await;
        assert_eq!(m[0].status, HealthStatus::Degraded);
        assert_eq!(m[0].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_critical_value_is_immediate() {
        let config = config("");
        let probe = Scripted::new(vec![Some(5000.0)]);
        let mut monitor = monitor(&config, probe);
        let m = monitor.run_tick().await;
        assert_eq!(m[0].status, HealthStatus::Critical);
        assert_eq!(m[0].value, 5000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_synthesizes_critical_without_probing() {
        let config = config("");
        let probe = Scripted::new(vec![None, None, Some(10.0)]);
        let mut monitor = monitor(&config, Arc::clone(&probe));

        monitor.run_tick().await;
        monitor.run_tick().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        let m = monitor.run_tick().await;
        assert_eq!(m[0].status, HealthStatus::Critical);
        assert!(m[0].value.is_nan());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.breaker_states()[0].1, CircuitState::Open);

        // After the recovery timeout the probe runs again and leaves CRITICAL
        tokio::time::advance(Duration::from_secs(61)).await;
        let m = monitor.run_tick().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(m[0].status, HealthStatus::Recovering);
    }

    #[tokio::test]
    async fn test_per_symbol_checks_fan_out() {
        let config = config(
            r#"  - name: tick_age
    type: tick_freshness
    timeout: 1s
    thresholds: { multiplier: 5.0, crit_ms: 60000 }
    per_symbol: true"#,
        );
        let probe = Scripted::new(vec![Some(1.0); 3]);
        let mut monitor = monitor(&config, probe);
        assert_eq!(
            monitor.check_names(),
            vec!["latency", "tick_age:EURUSD", "tick_age:XAUUSD"]
        );
        let metrics = monitor.run_tick().await;
        assert_eq!(metrics.len(), 3);
        assert_eq!(
            monitor.check_config("tick_age:XAUUSD").map(|c| c.kind),
            Some(CheckKind::TickFreshness)
        );
    }
}
