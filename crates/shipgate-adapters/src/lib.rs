//! Shipgate adapters: concrete scorer, backend and status feed
//!
//! - [`DockerBackend`]: runs the change as a container via the docker CLI
//! - [`JenkinsStatusFeed`]: reads build results from the Jenkins JSON API
//! - [`HttpRiskScorer`]: asks an HTTP risk model for a score
//!
//! Each adapter has a `from_env()` constructor in the style of the other
//! Shipgate configs.

pub mod docker;
pub mod error;
pub mod jenkins;
pub mod scorer;

pub use docker::{ContainerState, DockerBackend, DockerConfig};
pub use error::AdapterError;
pub use jenkins::{JenkinsConfig, JenkinsStatusFeed};
pub use scorer::{HttpRiskScorer, ScorerConfig};

/// Result type for adapter internals
pub type Result<T> = std::result::Result<T, AdapterError>;
