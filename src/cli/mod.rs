//! Command-line interface for subrun.
//!
//! `subrun [--config PATH]` loads and validates the configuration, starts a
//! trigger per subscription and runs until interrupted.
//!
//! Environment:
//! - `PUBSUB_EMULATOR_HOST`: talk to a Pub/Sub emulator at `host:port` for
//!   every subscription instead of the real service
//! - `PUBSUB_PROJECT_ID`: project used with the emulator
//!   (default `fake-project`)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};

use crate::adapters::{PubSubClient, ShellRunner};
use crate::config::{Config, ConfigError, DEFAULT_CONFIG_PATH};
use crate::core::{launcher_for, Orchestrator};

pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";
pub const PROJECT_ID_ENV: &str = "PUBSUB_PROJECT_ID";
pub const DEFAULT_EMULATOR_PROJECT: &str = "fake-project";

/// subrun - run shell tasks for Pub/Sub messages
#[derive(Parser, Debug)]
#[command(name = "subrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Errors that end the process
#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("{}: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("{0:#}")]
    Startup(anyhow::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Unreadable { .. } => 1,
            Self::Invalid { .. } => 2,
            Self::Startup(_) => 1,
        }
    }
}

impl From<CliError> for ExitCode {
    fn from(e: CliError) -> Self {
        ExitCode::from(e.exit_code())
    }
}

impl Cli {
    /// Execute until interrupted
    pub async fn execute(self) -> Result<(), CliError> {
        let config = load_config(&self.config)?;

        let mut orchestrator = Orchestrator::new(Arc::new(ShellRunner::new()))
            .with_launcher(launcher_for(config.max_concurrent_pipelines));
        if let Some(client) = emulator_client() {
            orchestrator = orchestrator.with_client_override(Arc::new(client));
        }

        orchestrator.start(&config).await.map_err(CliError::Startup)?;
        info!(config = %self.config.display(), "running; interrupt to stop");

        let signal = tokio::signal::ctrl_c().await;

        info!("shutting down");
        orchestrator.shutdown().await;

        signal
            .context("failed to listen for interrupt")
            .map_err(CliError::Startup)
    }
}

/// Read and validate the configuration file
pub fn load_config(path: &Path) -> Result<Config, CliError> {
    let config = Config::from_file(path).map_err(|source| CliError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    config.check().map_err(|source| CliError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(config)
}

/// Emulator `(host, project)` for the given environment values, if a host is
/// set
pub fn emulator_settings(host: Option<String>, project: Option<String>) -> Option<(String, String)> {
    let host = host.filter(|h| !h.is_empty())?;
    let project = match project.filter(|p| !p.is_empty()) {
        Some(project) => project,
        None => {
            warn!(
                "{} not set, defaulting to {:?}",
                PROJECT_ID_ENV, DEFAULT_EMULATOR_PROJECT
            );
            DEFAULT_EMULATOR_PROJECT.to_string()
        }
    };
    Some((host, project))
}

/// Emulator client configured from the environment, if
/// `PUBSUB_EMULATOR_HOST` is set
pub fn emulator_client() -> Option<PubSubClient> {
    let (host, project) = emulator_settings(
        std::env::var(EMULATOR_HOST_ENV).ok(),
        std::env::var(PROJECT_ID_ENV).ok(),
    )?;

    info!(host = %host, project = %project, "using Pub/Sub emulator");
    Some(PubSubClient::emulator(&host, &project))
}
