//! HTTP risk model client
//!
//! POSTs the change descriptor as JSON and expects `{"score": f}` back.
//! Older model servers answer with `error_probability` or `errorProbability`;
//! all three are accepted.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipgate_core::{ChangeDescriptor, RiskAssessment, RiskScorer, ScorerError};
use tracing::debug;

use crate::Result;

/// Risk model endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Full URL of the scoring endpoint
    pub url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        ScorerConfig {
            url: std::env::var("SHIPGATE_SCORER_URL")
                .unwrap_or_else(|_| "http://localhost:8000/score".to_string()),
            timeout_ms: None,
        }
    }
}

impl ScorerConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(url: &str) -> Self {
        ScorerConfig {
            url: url.to_string(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(alias = "error_probability", alias = "errorProbability")]
    score: f64,
}

/// Parse a model response body into a validated assessment.
pub fn parse_score(body: &str) -> std::result::Result<RiskAssessment, ScorerError> {
    let response: ScoreResponse = serde_json::from_str(body)
        .map_err(|e| ScorerError::Unavailable(format!("unparseable score response: {e}")))?;
    RiskAssessment::now(response.score).map_err(|e| ScorerError::Unavailable(e.to_string()))
}

/// HTTP-backed [`RiskScorer`]
#[derive(Debug, Clone)]
pub struct HttpRiskScorer {
    config: ScorerConfig,
    http_client: reqwest::Client,
}

impl HttpRiskScorer {
    pub fn new(config: ScorerConfig) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("shipgate/", env!("CARGO_PKG_VERSION")));
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        Ok(HttpRiskScorer {
            config,
            http_client: builder.build()?,
        })
    }

    /// Create scorer from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ScorerConfig::from_env())
    }
}

#[async_trait]
impl RiskScorer for HttpRiskScorer {
    async fn score(
        &self,
        descriptor: &ChangeDescriptor,
    ) -> std::result::Result<RiskAssessment, ScorerError> {
        descriptor
            .validate()
            .map_err(|e| ScorerError::InvalidInput(e.to_string()))?;

        let response = self
            .http_client
            .post(&self.config.url)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| ScorerError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ScorerError::Unavailable(e.to_string()))?;
        debug!(status = %status, url = %self.config.url, "risk model responded");

        match status.as_u16() {
            200..=299 => parse_score(&body),
            400 | 422 => Err(ScorerError::InvalidInput(format!(
                "model rejected descriptor ({status}): {}",
                body.trim()
            ))),
            _ => Err(ScorerError::Unavailable(format!("model returned {status}"))),
        }
    }
}
