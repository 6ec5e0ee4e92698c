//! CLI command definitions and dispatch.

mod create;
mod ps;

use std::path::PathBuf;

use cage_core::config::CageConfig;
use clap::{Parser, Subcommand};

/// Cage - provision container volumes and runtime specs from OCI images.
#[derive(Parser)]
#[command(name = "cage", version, about)]
pub struct Cli {
    /// Enable debug logging (also enabled by DEBUG=1)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Parent dataset for the shared volume namespace
    #[arg(long, global = true, env = "CAGE_DATASET")]
    pub dataset: Option<String>,

    /// Root directory holding container volumes and the content store
    #[arg(long, global = true, env = "CAGE_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Provision a container from an image reference
    Create(create::CreateArgs),
    /// List provisioned containers (default)
    Ps(ps::PsArgs),
}

impl Cli {
    /// Whether debug output was requested by flag or environment.
    pub fn debug_enabled(&self) -> bool {
        self.debug || CageConfig::from_env().debug
    }

    /// Configuration from the environment with command-line overrides applied.
    pub fn config(&self) -> Result<CageConfig, cage_core::CageError> {
        let mut config = CageConfig::from_env();
        if let Some(root) = &self.root {
            let dataset = std::mem::take(&mut config.dataset);
            config = CageConfig {
                dataset,
                debug: config.debug,
                ..CageConfig::with_root(root)
            };
        }
        if let Some(dataset) = &self.dataset {
            config.dataset = dataset.clone();
        }
        config.debug |= self.debug;
        config.validate()?;
        Ok(config)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.config()?;
    tracing::debug!(root = %config.root.display(), namespace = %config.namespace(), "Loaded configuration");

    match cli.command {
        Some(Command::Create(args)) => create::execute(args, config).await,
        Some(Command::Ps(args)) => ps::execute(args, config).await,
        None => ps::execute(ps::PsArgs::default(), config).await,
    }
}
