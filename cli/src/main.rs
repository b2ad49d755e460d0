mod commands;
mod server;

use crate::server::DqGuardServer;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use dq_guard_core::config::DqGuardConfig;
use dq_guard_core::observability::init_logging;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dqguard")]
#[command(about = "Incident rule engine for data-quality check outcomes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "dqguard.yaml")]
        config: String,

        /// Port to listen on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Refresh once and evaluate all configured rules
    Evaluate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "dqguard.yaml")]
        config: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Report which rules would fire without sending alerts or deleting workflows
        #[arg(long)]
        dry_run: bool,
    },
    /// Show downstream workflow impact of the configured table
    Lineage {
        /// Path to the configuration file
        #[arg(short, long, default_value = "dqguard.yaml")]
        config: String,

        /// Case-insensitive filter on workflow or dataset name
        #[arg(short, long)]
        search: Option<String>,
    },
    /// Validate configured rules without dispatching
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "dqguard.yaml")]
        config: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn load_config(path: &str) -> Result<DqGuardConfig> {
    let config = DqGuardConfig::from_file(path)?;
    init_logging(&config.logging)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    match args.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "dqguard", &mut std::io::stdout());
        }
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            commands::validate(&config).await?;
        }
        Commands::Lineage { config, search } => {
            let config = load_config(&config)?;
            commands::lineage(&config, search.as_deref()).await?;
        }
        Commands::Evaluate {
            config,
            json,
            dry_run,
        } => {
            let config = load_config(&config)?;
            if dry_run {
                commands::preview(&config, json).await?;
            } else {
                commands::evaluate(&config, json).await?;
            }
        }
        Commands::Serve { config, port } => {
            println!("🔥 Initializing dqguard server...");
            let config_data = load_config(&config)?;
            let engine = commands::build_engine(&config_data)?;

            if let Err(e) = engine.refresh().await {
                warn!(error = %e, "Initial refresh failed, starting with an empty snapshot");
            }
            commands::seed_rules(&engine, &config_data).await;
            info!(rules = engine.rules().len(), "Engine ready");

            let server = DqGuardServer::new(Arc::new(engine), config_data.server.resolved_api_keys());
            server.run(port.unwrap_or(config_data.server.port)).await?;
        }
    }

    Ok(())
}
