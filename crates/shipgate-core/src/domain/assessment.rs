//! Risk assessments produced by the scorer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{GateError, Result};

/// A finite risk score in `[0, 1]` and the time it was computed.
///
/// The score can only be set through [`RiskAssessment::new`], so holding a
/// `RiskAssessment` means the score is usable. Deserialization goes through
/// the same check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAssessment")]
pub struct RiskAssessment {
    score: f64,
    computed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawAssessment {
    score: f64,
    computed_at: DateTime<Utc>,
}

impl TryFrom<RawAssessment> for RiskAssessment {
    type Error = GateError;

    fn try_from(raw: RawAssessment) -> Result<Self> {
        RiskAssessment::new(raw.score, raw.computed_at)
    }
}

impl RiskAssessment {
    pub fn new(score: f64, computed_at: DateTime<Utc>) -> Result<Self> {
        if !score.is_finite() {
            return Err(GateError::InvalidScore(format!("{score} is not finite")));
        }
        if !(0.0..=1.0).contains(&score) {
            return Err(GateError::InvalidScore(format!(
                "{score} is outside [0, 1]"
            )));
        }
        Ok(Self { score, computed_at })
    }

    /// Assessment stamped with the current time.
    pub fn now(score: f64) -> Result<Self> {
        Self::new(score, Utc::now())
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// Gating rule: strictly above the threshold blocks the deployment.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.score > threshold
    }
}
