//! Capacity Overlay CLI
//!
//! Operator tool for checking preference annotations before they reach a
//! NodePool, previewing cost decisions, and listing managed overlays.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{analyze, lint, overlays};

/// Capacity Overlay CLI
#[derive(Parser)]
#[command(name = "ovc")]
#[command(author, version, about = "CLI for the Capacity Overlay Controller", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse preference annotations and show the overlays they render to
    Lint {
        /// Annotations as key=value; key is the full annotation key or preference.N
        #[arg(required = true)]
        annotations: Vec<String>,

        /// NodePool the annotations belong to
        #[arg(long, default_value = "default")]
        nodepool: String,
    },

    /// Run the cost decision analysis read-only against Prometheus
    Analyze {
        /// Prometheus base URL
        #[arg(long, env = "OVERLAY_PROMETHEUS_URL")]
        prometheus_url: String,

        /// Utilization percent at or above which capacity counts as exhausted
        #[arg(long)]
        threshold: Option<f64>,

        /// Restrict queries to one AWS account
        #[arg(long)]
        account_id: Option<String>,

        /// Maximum accepted data age in seconds, for both data families
        #[arg(long)]
        max_data_age_secs: Option<u64>,

        /// Query timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// List NodeOverlay objects managed by the controller
    Overlays {
        /// Only overlays of this origin
        #[arg(long)]
        origin: Option<overlays::Origin>,

        /// Only preference overlays of this NodePool
        #[arg(long)]
        nodepool: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Lint {
            annotations,
            nodepool,
        } => {
            let clean = lint::lint_annotations(&nodepool, &annotations, cli.format)?;
            if !clean {
                std::process::exit(1);
            }
        }
        Commands::Analyze {
            prometheus_url,
            threshold,
            account_id,
            max_data_age_secs,
            timeout_secs,
        } => {
            let options = analyze::AnalyzeOptions {
                prometheus_url,
                threshold,
                account_id,
                max_data_age_secs,
                timeout_secs,
            };
            analyze::run_analysis(options, cli.format).await?;
        }
        Commands::Overlays { origin, nodepool } => {
            overlays::list_overlays(origin, nodepool, cli.format).await?;
        }
    }

    Ok(())
}
