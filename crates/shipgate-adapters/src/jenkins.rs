//! Jenkins build status feed
//!
//! Reads `{base}/job/{job}/{build}/api/json?tree=building,result`. The feed
//! never fails: anything it cannot read becomes [`BuildResult::Unknown`] and
//! the state machine keeps polling until its own deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipgate_core::{BuildRef, BuildResult, BuildStatus, StatusFeed};
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::Result;

/// Jenkins configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JenkinsConfig {
    /// Jenkins server URL
    pub base_url: String,
    /// User for basic auth (optional for anonymous read access)
    pub user: Option<String>,
    /// API token paired with `user`
    pub token: Option<String>,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        JenkinsConfig {
            base_url: std::env::var("JENKINS_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            user: std::env::var("JENKINS_USER").ok(),
            token: std::env::var("JENKINS_TOKEN").ok(),
        }
    }
}

impl JenkinsConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific server
    pub fn new(base_url: &str) -> Self {
        JenkinsConfig {
            base_url: base_url.to_string(),
            user: None,
            token: None,
        }
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, user: &str, token: &str) -> Self {
        self.user = Some(user.to_string());
        self.token = Some(token.to_string());
        self
    }

    /// JSON API URL for one build. Folder jobs (`team/app`) expand to
    /// `job/team/job/app`.
    pub fn build_url(&self, build: &BuildRef) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_string();
        for segment in build.job_id.split('/').filter(|s| !s.is_empty()) {
            url.push_str("/job/");
            url.push_str(segment);
        }
        url.push_str(&format!("/{}/api/json?tree=building,result", build.build_id));
        url
    }
}

#[derive(Debug, Deserialize)]
struct BuildInfo {
    #[serde(default)]
    building: bool,
    #[serde(default)]
    result: Option<String>,
}

/// Map a Jenkins build JSON body onto a [`BuildResult`].
pub fn parse_build_info(body: &str) -> Result<BuildResult> {
    let info: BuildInfo = serde_json::from_str(body)?;
    if info.building {
        return Ok(BuildResult::Running);
    }
    Ok(match info.result.as_deref() {
        None => BuildResult::Running,
        Some("SUCCESS") => BuildResult::Success,
        Some("FAILURE") | Some("UNSTABLE") | Some("ABORTED") => BuildResult::Failure,
        Some(_) => BuildResult::Unknown,
    })
}

/// Jenkins-backed [`StatusFeed`]
#[derive(Debug, Clone)]
pub struct JenkinsStatusFeed {
    config: JenkinsConfig,
    http_client: reqwest::Client,
}

impl JenkinsStatusFeed {
    pub fn new(config: JenkinsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("shipgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(JenkinsStatusFeed {
            config,
            http_client,
        })
    }

    /// Create feed from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(JenkinsConfig::from_env())
    }

    async fn fetch(&self, build: &BuildRef) -> Result<BuildResult> {
        let url = self.config.build_url(build);
        let mut request = self.http_client.get(&url);
        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.token.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Queued builds have no page yet.
            debug!(build = %build, "build not found yet");
            return Ok(BuildResult::Unknown);
        }
        if !status.is_success() {
            return Err(AdapterError::Http(format!("GET {url} returned {status}")));
        }
        let body = response.text().await?;
        parse_build_info(&body)
    }
}

#[async_trait]
impl StatusFeed for JenkinsStatusFeed {
    async fn latest(&self, build: &BuildRef) -> BuildStatus {
        match self.fetch(build).await {
            Ok(result) => BuildStatus::new(build, result),
            Err(e) => {
                warn!(build = %build, error = %e, "failed to read build status");
                BuildStatus::unknown(build)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_jobs_expand_to_nested_paths() {
        let config = JenkinsConfig::new("https://ci.example.com/");
        assert_eq!(
            config.build_url(&BuildRef::new("team/app", 12)),
            "https://ci.example.com/job/team/job/app/12/api/json?tree=building,result"
        );
        assert_eq!(
            config.build_url(&BuildRef::new("app", 3)),
            "https://ci.example.com/job/app/3/api/json?tree=building,result"
        );
    }

    #[test]
    fn maps_jenkins_results() {
        let cases = [
            (r#"{"building":true,"result":null}"#, BuildResult::Running),
            (r#"{"building":false,"result":null}"#, BuildResult::Running),
            (r#"{"building":false,"result":"SUCCESS"}"#, BuildResult::Success),
            (r#"{"building":false,"result":"FAILURE"}"#, BuildResult::Failure),
            (r#"{"building":false,"result":"UNSTABLE"}"#, BuildResult::Failure),
            (r#"{"building":false,"result":"ABORTED"}"#, BuildResult::Failure),
            (r#"{"building":false,"result":"NOT_BUILT"}"#, BuildResult::Unknown),
        ];
        for (body, expected) in cases {
            assert_eq!(parse_build_info(body).unwrap(), expected, "{body}");
        }
        assert!(parse_build_info("<html>").is_err());
    }

    #[tokio::test]
    async fn unreachable_server_reads_as_unknown() {
        let feed = JenkinsStatusFeed::new(JenkinsConfig::new("http://127.0.0.1:9")).unwrap();
        let status = feed.latest(&BuildRef::new("app", 1)).await;
        assert_eq!(status.result, BuildResult::Unknown);
    }
}
