use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dwh_core::LoadError;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dwh-cli")]
#[command(about = "Incremental star-schema loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transform pending input files and load them into the warehouse.
    Load {
        /// Print the load report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List input files not yet recorded in the manifest.
    Pending,
    /// List scrape dates in [start, end) not yet recorded in the date manifest.
    PendingDates {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        manifest: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Load { json: false })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if is_domain_error(&err) {
                error!(
                    error = %format!("{err:#}"),
                    "Due to raised error the program will be terminated."
                );
            } else {
                error!(
                    error = %format!("{err:#}"),
                    "An unexpected error has occurred. The program will be terminated."
                );
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Load { json } => match dwh_load::run_once_from_env().await? {
            Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
            Some(report) => println!(
                "load complete: run_id={} fact_rows={} new_rows={:?} files={}",
                report.run_id,
                report.fact_rows,
                report.new_rows,
                report.processed_units.len()
            ),
            None => println!("nothing to load"),
        },
        Commands::Pending => {
            for key in dwh_load::pending_units_from_env().await? {
                println!("{key}");
            }
        }
        Commands::PendingDates {
            start,
            end,
            manifest,
        } => {
            for date in dwh_load::pending_dates_from_env(start, end, manifest).await? {
                println!("{date}");
            }
        }
    }
    Ok(())
}

/// Failures the loader raised deliberately, as opposed to unexpected IO or driver faults.
fn is_domain_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<LoadError>()
            .is_some_and(|e| !matches!(e, LoadError::Transport { .. }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn domain_errors_are_found_through_context() {
        let err = Err::<(), _>(LoadError::InvalidConfig("fact.key must not be empty".into()))
            .context("parsing loader.yaml")
            .unwrap_err();
        assert!(is_domain_error(&err));

        let transport = anyhow::Error::new(LoadError::transport("connecting", "refused"));
        assert!(!is_domain_error(&transport));
        assert!(!is_domain_error(&anyhow::anyhow!("disk full")));
    }

    #[test]
    fn pending_dates_parses_iso_dates() {
        let cli = Cli::try_parse_from([
            "dwh-cli",
            "pending-dates",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-08",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::PendingDates { manifest: None, .. })
        ));
    }
}
