//! Docker execution backend
//!
//! Drives the `docker` CLI through `tokio::process`. Each attempt owns one
//! container named `<prefix><attempt id>`; the name is the idempotency key
//! for `create`, so a retried or replayed create never makes a second
//! container.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipgate_core::{
    AttemptId, BackendError, BackendHandle, BackendStatus, ChangeDescriptor, DeploymentBackend,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::Result;

const INSPECT_FORMAT: &str = "{{.Id}} {{.State.Status}} {{.State.ExitCode}}";

/// Docker backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path or name of the docker binary
    pub binary: String,
    /// Container name prefix; the attempt id is appended
    pub name_prefix: String,
    /// Extra arguments passed to `docker create` before the image
    pub create_args: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            binary: std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            name_prefix: "shipgate-".to_string(),
            create_args: Vec::new(),
        }
    }
}

impl DockerConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Use a specific docker binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn container_name(&self, attempt_id: AttemptId) -> String {
        format!("{}{}", self.name_prefix, attempt_id)
    }
}

/// Container facts read back from `docker inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub status: String,
    pub exit_code: i64,
}

impl ContainerState {
    /// Map docker's container status onto the backend contract.
    pub fn backend_status(&self) -> BackendStatus {
        match self.status.as_str() {
            "running" => BackendStatus::Running,
            "created" | "restarting" => BackendStatus::Starting,
            "paused" | "removing" => BackendStatus::Stopped,
            "exited" if self.exit_code == 0 => BackendStatus::Stopped,
            "exited" | "dead" => BackendStatus::Errored,
            _ => BackendStatus::Unknown,
        }
    }

    /// Whether `docker stop` has anything left to do.
    fn is_live(&self) -> bool {
        !matches!(self.status.as_str(), "created" | "exited" | "dead")
    }
}

/// Parse one line of `docker inspect --format` output.
pub fn parse_inspect(line: &str) -> Option<ContainerState> {
    let mut parts = line.split_whitespace();
    let id = parts.next()?.to_string();
    let status = parts.next()?.to_string();
    let exit_code = parts.next()?.parse().ok()?;
    Some(ContainerState {
        id,
        status,
        exit_code,
    })
}

/// Sort a docker CLI failure into the error kinds callers branch on.
fn classify_failure(command: &str, stderr: &str) -> AdapterError {
    let stderr = stderr.trim();
    if stderr.contains("No such container") || stderr.contains("No such object") {
        AdapterError::NoSuchContainer(stderr.to_string())
    } else if stderr.contains("Conflict") || stderr.contains("is already in use") {
        AdapterError::NameConflict(stderr.to_string())
    } else {
        AdapterError::DockerFailed {
            command: command.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

/// Docker-backed implementation of [`DeploymentBackend`].
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        DockerBackend { config }
    }

    /// Create backend from environment variables
    pub fn from_env() -> Self {
        Self::new(DockerConfig::from_env())
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// Run one docker subcommand and return trimmed stdout.
    async fn docker(&self, args: &[String]) -> Result<String> {
        let command = args.first().map(String::as_str).unwrap_or_default();
        debug!(binary = %self.config.binary, ?args, "running docker");

        // A caller-side timeout drops this future; the child goes with it.
        let output = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(classify_failure(
                command,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Inspect a container by name or id; `None` when it does not exist.
    pub async fn inspect(&self, target: &str) -> Result<Option<ContainerState>> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            target.to_string(),
        ];
        match self.docker(&args).await {
            Ok(out) => parse_inspect(&out)
                .map(Some)
                .ok_or_else(|| AdapterError::UnexpectedResponse(format!("docker inspect: {out}"))),
            Err(AdapterError::NoSuchContainer(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_args(&self, name: &str, attempt_id: AttemptId, d: &ChangeDescriptor) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("shipgate.attempt={attempt_id}"),
            "--label".to_string(),
            format!("shipgate.revision={}", d.revision),
            "--label".to_string(),
            format!("shipgate.environment={}", d.environment),
        ];
        for (key, value) in &d.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend(self.config.create_args.iter().cloned());
        args.push(d.artifact.clone());
        args
    }

    async fn create_container(
        &self,
        attempt_id: AttemptId,
        descriptor: &ChangeDescriptor,
    ) -> Result<BackendHandle> {
        let name = self.config.container_name(attempt_id);
        if let Some(existing) = self.inspect(&name).await? {
            debug!(container = %name, "container already exists, reusing");
            return Ok(BackendHandle(existing.id));
        }

        match self
            .docker(&self.create_args(&name, attempt_id, descriptor))
            .await
        {
            Ok(id) if !id.is_empty() => {
                info!(container = %name, id = %id, artifact = %descriptor.artifact, "container created");
                Ok(BackendHandle(id))
            }
            Ok(_) => Err(AdapterError::UnexpectedResponse(
                "docker create printed no container id".to_string(),
            )),
            // Lost a race with a concurrent create for the same attempt.
            Err(AdapterError::NameConflict(msg)) => match self.inspect(&name).await? {
                Some(existing) => Ok(BackendHandle(existing.id)),
                None => Err(AdapterError::NameConflict(msg)),
            },
            Err(e) => Err(e),
        }
    }

    async fn stop_container(&self, handle: &BackendHandle) -> Result<()> {
        let Some(state) = self.inspect(handle.as_str()).await? else {
            debug!(container = %handle, "container gone, nothing to stop");
            return Ok(());
        };
        if !state.is_live() {
            debug!(container = %handle, status = %state.status, "container not running, nothing to stop");
            return Ok(());
        }
        match self
            .docker(&["stop".to_string(), handle.as_str().to_string()])
            .await
        {
            Ok(_) | Err(AdapterError::NoSuchContainer(_)) => {
                info!(container = %handle, "container stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DeploymentBackend for DockerBackend {
    async fn create(
        &self,
        attempt_id: AttemptId,
        descriptor: &ChangeDescriptor,
    ) -> std::result::Result<BackendHandle, BackendError> {
        self.create_container(attempt_id, descriptor)
            .await
            .map_err(|e| BackendError::CreateFailed(e.to_string()))
    }

    async fn start(&self, handle: &BackendHandle) -> std::result::Result<(), BackendError> {
        self.docker(&["start".to_string(), handle.as_str().to_string()])
            .await
            .map(|_| ())
            .map_err(|e| BackendError::StartFailed(e.to_string()))
    }

    async fn stop(&self, handle: &BackendHandle) -> std::result::Result<(), BackendError> {
        self.stop_container(handle)
            .await
            .map_err(|e| BackendError::StopFailed(e.to_string()))
    }

    async fn status(&self, handle: &BackendHandle) -> BackendStatus {
        match self.inspect(handle.as_str()).await {
            Ok(Some(state)) => state.backend_status(),
            Ok(None) => BackendStatus::Unknown,
            Err(e) => {
                warn!(container = %handle, error = %e, "docker inspect failed");
                BackendStatus::Unknown
            }
        }
    }
}
