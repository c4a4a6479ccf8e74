//! Health check command.
//!
//! Queries `/health` and displays queue and worker statistics.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include scheduler counters
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_header("System Health");
            output::print_detail("Status", status);
            output::print_detail("API URL", client.base_url());

            for key in ["service", "version", "store", "timestamp"] {
                if let Some(value) = health.get(key).and_then(|v| v.as_str()) {
                    output::print_detail(key, value);
                }
            }

            if let Some(scheduler) = health.get("scheduler").and_then(|v| v.as_object()) {
                let count = |name: &str| {
                    scheduler
                        .get(name)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "?".to_string())
                };
                output::print_detail(
                    "Queue",
                    &format!("{} / {}", count("pending"), count("queue_capacity")),
                );
                output::print_detail(
                    "Workers",
                    &format!("{} active of {}", count("active"), count("max_concurrency")),
                );

                if args.detailed {
                    output::print_header("Scheduler");
                    for name in ["processed", "succeeded", "failed", "aborted"] {
                        output::print_detail(name, &count(name));
                    }
                }
            }

            if status == "ok" {
                output::print_success("All systems operational");
            } else {
                output::print_error(&format!("System status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}
