//! Error types for shipgate-adapters

use thiserror::Error;

/// Errors raised inside the concrete adapters before they are folded into
/// the core `ScorerError` / `BackendError` kinds.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Docker CLI exited with a failure
    #[error("docker {command} failed: {stderr}")]
    DockerFailed { command: String, stderr: String },

    /// Container name already taken
    #[error("container name conflict: {0}")]
    NameConflict(String),

    /// No such container
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// Response body could not be understood
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error (process spawn, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        AdapterError::Http(err.to_string())
    }
}
