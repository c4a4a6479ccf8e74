//! Sutra CLI - Command-line interface for the Sutra render job server.
//!
//! Provides commands for submitting and inspecting render jobs and checking health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{health, job};
use output::OutputFormat;

/// Sutra - Render Job Engine CLI
#[derive(Parser)]
#[command(
    name = "sutra",
    version,
    about = "Sutra - Render Job Engine",
    long_about = "CLI tool for submitting render jobs to a Sutra server and following their progress.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "SUTRA_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// API key sent as x-api-key
    #[arg(long, global = true, env = "SUTRA_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Check server health
    Health(health::HealthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let client = client::ApiClient::new(&cli.api_url, cli.api_key.clone())?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
