//! Gate configuration consumed by the state machine.
//!
//! Durations are written as integer milliseconds (`*_ms` keys) so the same
//! struct reads cleanly from TOML files and JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GateError, Result};

/// Policy knobs for one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Scores strictly above this value abort the attempt.
    pub threshold: f64,

    /// Extra scorer calls after a `ScorerUnavailable` failure.
    pub scorer_retry_limit: u32,

    /// Delay between scorer retries.
    #[serde(rename = "scorer_retry_backoff_ms", with = "duration_ms")]
    pub scorer_retry_backoff: Duration,

    /// How long Monitoring waits for a terminal build status.
    #[serde(rename = "monitoring_timeout_ms", with = "duration_ms")]
    pub monitoring_timeout: Duration,

    /// Delay between status feed polls.
    #[serde(rename = "monitoring_poll_interval_ms", with = "duration_ms")]
    pub monitoring_poll_interval: Duration,

    /// Upper bound on any single scorer or backend call.
    #[serde(rename = "adapter_call_timeout_ms", with = "opt_duration_ms")]
    pub adapter_call_timeout: Option<Duration>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            scorer_retry_limit: 2,
            scorer_retry_backoff: Duration::from_millis(250),
            monitoring_timeout: Duration::from_secs(600),
            monitoring_poll_interval: Duration::from_secs(5),
            adapter_call_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl GateConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_scorer_retry_limit(mut self, limit: u32) -> Self {
        self.scorer_retry_limit = limit;
        self
    }

    pub fn with_scorer_retry_backoff(mut self, backoff: Duration) -> Self {
        self.scorer_retry_backoff = backoff;
        self
    }

    pub fn with_monitoring(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.monitoring_timeout = timeout;
        self.monitoring_poll_interval = poll_interval;
        self
    }

    pub fn with_adapter_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.adapter_call_timeout = timeout;
        self
    }

    /// Total scorer calls allowed per attempt (initial call plus retries).
    pub fn max_scorer_calls(&self) -> u32 {
        self.scorer_retry_limit.saturating_add(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(GateError::InvalidConfig(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.monitoring_timeout.is_zero() {
            return Err(GateError::InvalidConfig(
                "monitoring_timeout must be greater than zero".to_string(),
            ));
        }
        if self.monitoring_poll_interval.is_zero() {
            return Err(GateError::InvalidConfig(
                "monitoring_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.monitoring_poll_interval > self.monitoring_timeout {
            return Err(GateError::InvalidConfig(format!(
                "monitoring_poll_interval ({}ms) exceeds monitoring_timeout ({}ms)",
                self.monitoring_poll_interval.as_millis(),
                self.monitoring_timeout.as_millis()
            )));
        }
        if matches!(self.adapter_call_timeout, Some(t) if t.is_zero()) {
            return Err(GateError::InvalidConfig(
                "adapter_call_timeout must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
