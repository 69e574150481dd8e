//! counterpoint service binary.
//!
//! Usage:
//!   counterpoint serve
//!   counterpoint analyze --id tweet-100 --text "This is a political tweet" [--user u1]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use counterpoint::config::Config;
use counterpoint::http::start_http_server;
use counterpoint::pipeline::{AnalysisPipeline, Caller, InterveneRequest, PipelineError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "counterpoint")]
#[command(about = "Political framing and fallacy analysis service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve,
    /// Analyze one post and print the result as JSON
    Analyze {
        /// Content id; derived from the text when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        text: String,
        /// Evaluate an intervention decision against this user's stored profile
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Analyze { id, text, user } => analyze(config, id, text, user).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting counterpoint {}", env!("CARGO_PKG_VERSION"));
    let pipeline = AnalysisPipeline::from_config(config).context("Failed to build pipeline")?;
    start_http_server(Arc::new(pipeline)).await
}

async fn analyze(config: Config, id: Option<String>, text: String, user: Option<String>) -> Result<()> {
    let pipeline = AnalysisPipeline::from_config(config).context("Failed to build pipeline")?;
    let caller = Caller {
        user_id: user,
        byok_key: None,
    };
    let request = InterveneRequest {
        id,
        text,
        ..Default::default()
    };

    let out = match pipeline.should_intervene(&request, &caller).await {
        Ok(resp) => serde_json::to_value(resp)?,
        Err(PipelineError::Rejected(rejection)) => {
            anyhow::bail!("{} ({})", rejection.message, rejection.code.as_str())
        }
        Err(PipelineError::Service(e)) => return Err(e).context("Analysis failed"),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
