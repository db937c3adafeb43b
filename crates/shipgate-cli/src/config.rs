//! `shipgate.toml` loading.
//!
//! Every section is optional; missing keys fall back to defaults, and the
//! adapter sections fall back to their environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shipgate_adapters::{DockerConfig, JenkinsConfig, ScorerConfig};
use shipgate_core::GateConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// JSONL file to append attempt records to
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub gate: GateConfig,
    pub scorer: ScorerConfig,
    pub jenkins: JenkinsConfig,
    pub docker: DockerConfig,
    pub journal: JournalConfig,
}

impl FileConfig {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// TOML rendering with credentials masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.jenkins.token.is_some() {
            shown.jenkins.token = Some("***".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to render config")
    }
}
