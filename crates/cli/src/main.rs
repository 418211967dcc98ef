//! schedctl - operator CLI for the replica scheduler
//!
//! Scales scheduled Deployments by hand through the scheduler's control API
//! and shows which Deployments are scheduled and where they stand.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{scale, status, version};
use scheduler_lib::workload::ScaleState;
use std::path::PathBuf;

/// Replica Scheduler CLI
#[derive(Parser)]
#[command(name = "schedctl")]
#[command(author, version, about = "CLI for the Replica Scheduler", long_about = None)]
pub struct Cli {
    /// Scheduler API URL (default: config file, then http://localhost:8081)
    #[arg(long, env = "SCHEDCTL_API_URL")]
    pub api_url: Option<String>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scale a Deployment to zero, remembering its replica count
    ScaleDown {
        /// Deployment as <namespace>/<name>
        workload: String,
    },

    /// Restore a Deployment's remembered replica count
    ScaleUp {
        /// Deployment as <namespace>/<name>
        workload: String,
    },

    /// Show client and scheduler versions
    Version,

    /// Show scheduling status of Deployments
    Status {
        /// Only look at this namespace (default: config file, then all namespaces)
        #[arg(long, short)]
        namespace: Option<String>,

        /// Include Deployments without scheduling enabled
        #[arg(long)]
        all: bool,

        /// Evaluate windows in UTC instead of local time
        #[arg(long)]
        utc: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url.as_deref()))?;

    match cli.command {
        Commands::ScaleDown { workload } => {
            scale::scale(&client, &workload, ScaleState::Suspended, cli.format).await?;
        }
        Commands::ScaleUp { workload } => {
            scale::scale(&client, &workload, ScaleState::Running, cli.format).await?;
        }
        Commands::Version => {
            version::show_version(&client, cli.format).await?;
        }
        Commands::Status {
            namespace,
            all,
            utc,
        } => {
            let namespace = namespace.or(config.default_namespace);
            status::show_status(
                cli.kubeconfig.as_deref(),
                namespace.as_deref(),
                all,
                utc,
                cli.format,
            )
            .await?;
        }
    }

    Ok(())
}
