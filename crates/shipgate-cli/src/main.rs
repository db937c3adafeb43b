//! Shipgate - risk-gated deployment CLI
//!
//! ## Commands
//!
//! - `run`: score a change, deploy it, watch its build, roll back on failure
//! - `recover`: list (and optionally tear down) attempts a crash left behind
//! - `config`: print the effective configuration
//! - `validate`: check a change descriptor without running it

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shipgate_adapters::{DockerBackend, HttpRiskScorer, JenkinsStatusFeed};
use shipgate_core::{
    read_jsonl, recovery_points, AttemptState, BuildRef, ChangeDescriptor, DeploymentAttempt,
    DeploymentBackend, JsonlJournal, PipelineController, RecoveryPoint, METRICS,
};
use tracing::{info, warn, Level};

use crate::config::FileConfig;

#[derive(Parser)]
#[command(name = "shipgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Risk-gated deployment controller", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to shipgate.toml
    #[arg(short, long, global = true, env = "SHIPGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score, deploy and monitor one change
    Run {
        #[command(flatten)]
        change: DescriptorArgs,

        /// Override the risk threshold (0.0 - 1.0)
        #[arg(long)]
        threshold: Option<f64>,

        /// Append attempt records to this JSONL journal
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Risk model endpoint
        #[arg(long, env = "SHIPGATE_SCORER_URL")]
        scorer_url: Option<String>,

        /// Jenkins base URL
        #[arg(long, env = "JENKINS_URL")]
        jenkins_url: Option<String>,
    },

    /// List attempts a journal shows as interrupted while holding a resource
    Recover {
        /// Journal to read (default: [journal].path from the config)
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Stop every leftover container through the docker backend
        #[arg(long)]
        teardown: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Validate a change descriptor and print its digest
    Validate {
        #[command(flatten)]
        change: DescriptorArgs,
    },
}

#[derive(Args)]
struct DescriptorArgs {
    /// Read the descriptor from a JSON file instead of flags
    #[arg(long, conflicts_with_all = ["artifact", "revision", "environment", "job", "build"])]
    descriptor: Option<PathBuf>,

    /// Artifact reference (e.g. registry/app:tag)
    #[arg(long)]
    artifact: Option<String>,

    /// Source revision
    #[arg(long)]
    revision: Option<String>,

    /// Target environment
    #[arg(long)]
    environment: Option<String>,

    /// CI job name (folder jobs as team/app)
    #[arg(long)]
    job: Option<String>,

    /// CI build number
    #[arg(long)]
    build: Option<u64>,

    /// Extra label, repeatable (key=value)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,
}

impl DescriptorArgs {
    fn to_descriptor(&self) -> Result<ChangeDescriptor> {
        let mut descriptor = match &self.descriptor {
            Some(path) => read_descriptor(path)?,
            None => {
                let (Some(artifact), Some(revision), Some(environment), Some(job), Some(build)) = (
                    &self.artifact,
                    &self.revision,
                    &self.environment,
                    &self.job,
                    self.build,
                ) else {
                    bail!(
                        "either --descriptor or all of --artifact, --revision, --environment, --job, --build are required"
                    );
                };
                ChangeDescriptor::new(
                    artifact.as_str(),
                    revision.as_str(),
                    environment.as_str(),
                    BuildRef::new(job.as_str(), build),
                )?
            }
        };
        for (key, value) in &self.labels {
            descriptor = descriptor.with_label(key.as_str(), value.as_str());
        }
        Ok(descriptor)
    }
}

fn read_descriptor(path: &Path) -> Result<ChangeDescriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor {}", path.display()))?;
    let descriptor: ChangeDescriptor = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse descriptor {}", path.display()))?;
    descriptor.validate()?;
    Ok(descriptor)
}

fn parse_label(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Process exit status for a finished attempt.
fn exit_code(attempt: &DeploymentAttempt) -> u8 {
    match attempt.terminal_outcome() {
        Some(o) if o.is_rollback_failure() => 4,
        Some(o) => match o.state {
            AttemptState::Succeeded => 0,
            AttemptState::Aborted => 2,
            AttemptState::RolledBack => 3,
            _ => 1,
        },
        None => 1,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipgate_core::init_tracing(cli.json, level);

    let file_config = FileConfig::load(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Run {
            change,
            threshold,
            journal,
            scorer_url,
            jenkins_url,
        } => {
            let mut cfg = file_config;
            if let Some(t) = threshold {
                cfg.gate.threshold = t;
            }
            if let Some(url) = scorer_url {
                cfg.scorer.url = url;
            }
            if let Some(url) = jenkins_url {
                cfg.jenkins.base_url = url;
            }
            if journal.is_some() {
                cfg.journal.path = journal;
            }
            cmd_run(cfg, &change).await?
        }
        Commands::Recover { journal, teardown } => {
            let path = journal
                .or(file_config.journal.path.clone())
                .context("No journal given (use --journal or [journal].path)")?;
            cmd_recover(&file_config, &path, teardown).await?
        }
        Commands::Config => {
            print!("{}", file_config.to_redacted_toml()?);
            ExitCode::SUCCESS
        }
        Commands::Validate { change } => {
            let descriptor = change.to_descriptor()?;
            println!("valid: {} ({})", descriptor.build, descriptor.digest());
            ExitCode::SUCCESS
        }
    };

    METRICS.flush();
    Ok(code)
}

async fn cmd_run(cfg: FileConfig, change: &DescriptorArgs) -> Result<ExitCode> {
    let descriptor = change.to_descriptor()?;

    let scorer = HttpRiskScorer::new(cfg.scorer.clone()).context("Failed to build risk scorer")?;
    let feed =
        JenkinsStatusFeed::new(cfg.jenkins.clone()).context("Failed to build Jenkins client")?;
    let backend = DockerBackend::new(cfg.docker.clone());

    let mut controller = PipelineController::new(
        Arc::new(scorer),
        Arc::new(backend),
        Arc::new(feed),
        cfg.gate.clone(),
    )
    .context("Invalid [gate] configuration")?;
    if let Some(path) = &cfg.journal.path {
        info!(journal = %path.display(), "journaling attempt records");
        controller = controller.with_journal(Arc::new(JsonlJournal::new(path)));
    }

    let handle = controller.spawn(descriptor);
    let cancel = handle.cancel_token();
    let attempt_id = handle.id();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(attempt_id = %attempt_id, "interrupt received, cancelling attempt");
            cancel.cancel();
        }
    });

    let attempt = handle.join().await?;
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&attempt)?);
    Ok(ExitCode::from(exit_code(&attempt)))
}

async fn cmd_recover(cfg: &FileConfig, journal: &Path, teardown: bool) -> Result<ExitCode> {
    let records = read_jsonl(journal)
        .await
        .with_context(|| format!("Failed to read journal {}", journal.display()))?;
    let points = recovery_points(&records);

    let leftovers: Vec<_> = points
        .values()
        .filter(|p| p.needs_attention())
        .collect();
    if leftovers.is_empty() {
        println!("No attempts need attention ({} in journal)", points.len());
        return Ok(ExitCode::SUCCESS);
    }

    let backend = DockerBackend::new(cfg.docker.clone());
    let mut failures = 0;
    for point in leftovers {
        let handle = point.backend_handle.as_ref().map(|h| h.as_str()).unwrap_or("-");
        println!(
            "{}  state={}  handle={}{}",
            point.attempt_id,
            point.state,
            handle,
            recover_tag(point)
        );
        if let (true, Some(h)) = (teardown, &point.backend_handle) {
            match backend.stop(h).await {
                Ok(()) => println!("  stopped {h}"),
                Err(e) => {
                    failures += 1;
                    eprintln!("  failed to stop {h}: {e}");
                }
            }
        }
    }

    Ok(if failures > 0 {
        ExitCode::from(4)
    } else {
        ExitCode::SUCCESS
    })
}

fn recover_tag(point: &RecoveryPoint) -> &'static str {
    if point.rollback_failed() {
        "  (rollback failed)"
    } else if point.orphaned_resource() {
        "  (start failed)"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_labels() {
        assert_eq!(
            parse_label("team=payments").unwrap(),
            ("team".to_string(), "payments".to_string())
        );
        assert_eq!(parse_label("k=a=b").unwrap().1, "a=b");
        assert!(parse_label("novalue").is_err());
        assert!(parse_label("=x").is_err());
    }

    #[test]
    fn descriptor_from_flags_requires_every_field() {
        let cli = Cli::try_parse_from([
            "shipgate", "validate", "--artifact", "app:1", "--revision", "abc",
        ])
        .unwrap();
        let Commands::Validate { change } = cli.command else {
            panic!("expected validate");
        };
        assert!(change.to_descriptor().is_err());
    }

    #[test]
    fn descriptor_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("change.json");
        std::fs::write(
            &path,
            r#"{"artifact":"app:2","revision":"f00d","environment":"prod","build":{"job_id":"app","build_id":8}}"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "shipgate",
            "run",
            "--descriptor",
            path.to_str().unwrap(),
            "--label",
            "ticket=OPS-1",
        ])
        .unwrap();
        let Commands::Run { change, .. } = cli.command else {
            panic!("expected run");
        };
        let d = change.to_descriptor().unwrap();
        assert_eq!(d.build, BuildRef::new("app", 8));
        assert_eq!(d.labels.get("ticket").map(String::as_str), Some("OPS-1"));
    }

    #[test]
    fn exit_codes_follow_outcome() {
        use shipgate_core::fakes::{MemoryBackend, ScriptedScorer, ScriptedStatusFeed};
        use shipgate_core::{BuildResult, GateConfig};

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let run = |scorer: ScriptedScorer, backend: MemoryBackend, result: BuildResult| {
            let ctl = PipelineController::new(
                Arc::new(scorer),
                Arc::new(backend),
                Arc::new(ScriptedStatusFeed::always(result)),
                GateConfig::default(),
            )
            .unwrap();
            let d = ChangeDescriptor::new("app:1", "abc", "prod", BuildRef::new("app", 1)).unwrap();
            rt.block_on(ctl.run(d))
        };

        let ok = run(ScriptedScorer::fixed(0.1), MemoryBackend::new(), BuildResult::Success);
        let aborted = run(ScriptedScorer::fixed(0.9), MemoryBackend::new(), BuildResult::Success);
        let reverted = run(ScriptedScorer::fixed(0.1), MemoryBackend::new(), BuildResult::Failure);
        let stuck = run(
            ScriptedScorer::fixed(0.1),
            MemoryBackend::new().with_stop_failure("gone"),
            BuildResult::Failure,
        );
        let failed = run(
            ScriptedScorer::fixed(0.1),
            MemoryBackend::new().with_start_failure("nope"),
            BuildResult::Success,
        );

        assert_eq!(exit_code(&ok), 0);
        assert_eq!(exit_code(&aborted), 2);
        assert_eq!(exit_code(&reverted), 3);
        assert_eq!(exit_code(&stuck), 4);
        assert_eq!(exit_code(&failed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_lists_container_left_by_failed_start() {
        use shipgate_core::fakes::{MemoryBackend, ScriptedScorer, ScriptedStatusFeed};
        use shipgate_core::{BuildResult, GateConfig, MemoryJournal};

        let journal = Arc::new(MemoryJournal::new());
        let ctl = PipelineController::new(
            Arc::new(ScriptedScorer::fixed(0.1)),
            Arc::new(MemoryBackend::new().with_start_failure("port in use")),
            Arc::new(ScriptedStatusFeed::always(BuildResult::Success)),
            GateConfig::default(),
        )
        .unwrap()
        .with_journal(journal.clone());
        let d = ChangeDescriptor::new("app:1", "abc", "prod", BuildRef::new("app", 1)).unwrap();
        let attempt = ctl.run(d).await;

        let points = recovery_points(&journal.records());
        let point = &points[&attempt.id()];
        assert!(point.needs_attention());
        assert_eq!(recover_tag(point), "  (start failed)");
    }
}
