//! Adaptive baseline and N-of-M debouncing for a single health signal.
//!
//! A signal is judged against an exponential moving average of its own
//! history (`value > baseline * multiplier`), and status changes are only
//! made once the outcome repeats N times within the last M samples. A single
//! noisy sample never flips a status.

use std::collections::VecDeque;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Default EMA smoothing factor.
pub const DEFAULT_ALPHA: f64 = 0.1;

/// Default sliding window capacity.
pub const DEFAULT_WINDOW: usize = 5;

/// Samples required before any promote/demote decision is made.
const MIN_SAMPLES: usize = 3;

/// Outcome of an N-of-M evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisDecision {
    /// Move to a worse state.
    Promote,
    /// Move to a healthier state.
    Demote,
    /// Keep the prior state.
    NoChange,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("Invalid N-of-M rule '{0}'. Expected format: 3_of_5")]
    Format(String),
    #[error("Invalid N-of-M rule '{0}': N must be between 1 and M")]
    Bounds(String),
}

/// "N occurrences within the most recent M samples".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NOfMRule {
    pub n: usize,
    pub m: usize,
}

impl NOfMRule {
    pub fn new(n: usize, m: usize) -> Result<Self, RuleParseError> {
        if n == 0 || n > m {
            return Err(RuleParseError::Bounds(format!("{}_of_{}", n, m)));
        }
        Ok(Self { n, m })
    }
}

impl FromStr for NOfMRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_lowercase();
        let (n, m) = trimmed
            .split_once("_of_")
            .ok_or_else(|| RuleParseError::Format(s.to_string()))?;
        let n: usize = n.parse().map_err(|_| RuleParseError::Format(s.to_string()))?;
        let m: usize = m.parse().map_err(|_| RuleParseError::Format(s.to_string()))?;
        NOfMRule::new(n, m).map_err(|_| RuleParseError::Bounds(s.to_string()))
    }
}

impl std::fmt::Display for NOfMRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_of_{}", self.n, self.m)
    }
}

impl Serialize for NOfMRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NOfMRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-signal hysteresis state.
#[derive(Debug, Clone)]
pub struct HysteresisEvaluator {
    window: VecDeque<bool>,
    capacity: usize,
    alpha: f64,
    baseline: Option<f64>,
}

impl Default for HysteresisEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_ALPHA)
    }
}

impl HysteresisEvaluator {
    /// Creates an evaluator with a fixed window capacity and EMA factor.
    pub fn new(capacity: usize, alpha: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            baseline: None,
        }
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Folds `value` into the EMA. The first value seeds the baseline.
    pub fn update_baseline(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.baseline = Some(match self.baseline {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        });
    }

    /// `true` iff `value` exceeds `baseline * multiplier`. Always `false`
    /// until a baseline exists.
    pub fn evaluate_threshold(&self, value: f64, multiplier: f64) -> bool {
        match self.baseline {
            Some(baseline) => value > baseline * multiplier,
            None => false,
        }
    }

    /// Appends one outcome and decides whether the signal's status should move.
    ///
    /// Promotion is checked before demotion. Fewer than three recorded samples
    /// always yields `NoChange`.
    pub fn evaluate_n_of_m(
        &mut self,
        is_success: bool,
        promote: NOfMRule,
        demote: NOfMRule,
    ) -> HysteresisDecision {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(is_success);

        let len = self.window.len();
        if len < MIN_SAMPLES {
            return HysteresisDecision::NoChange;
        }

        if len >= promote.m {
            let failures = self.recent(promote.m).filter(|ok| !**ok).count();
            if failures >= promote.n {
                return HysteresisDecision::Promote;
            }
        }

        if len >= demote.m {
            let successes = self.recent(demote.m).filter(|ok| **ok).count();
            if successes >= demote.n {
                return HysteresisDecision::Demote;
            }
        }

        HysteresisDecision::NoChange
    }

    fn recent(&self, m: usize) -> impl Iterator<Item = &bool> {
        self.window.iter().rev().take(m)
    }
}
