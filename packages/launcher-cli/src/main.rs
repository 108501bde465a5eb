use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use launcher_cli::config::LauncherConfig;
use launcher_cli::coordinator::{LaunchRequest, Launcher};
use launcher_cli::registry::PluginRegistry;
use launcher_cli::runner::CwltoolRunner;

#[derive(Parser)]
#[command(name = "launcher")]
#[command(about = "Provision inputs, run a tool, provision its outputs", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tool descriptor against a job document
    Launch {
        /// Tool descriptor (CWL, YAML or JSON)
        #[arg(long)]
        descriptor: PathBuf,

        /// Job document binding inputs and output destinations
        #[arg(long)]
        job: PathBuf,

        /// Config file (defaults to $LAUNCHER_CONFIG, then ~/.config/launcher/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Leave the staging directory in place
        #[arg(long)]
        keep_working_directory: bool,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List enabled and disabled storage backends
    Plugins {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    // stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Launch {
            descriptor,
            job,
            config,
            keep_working_directory,
            report,
        } => {
            let mut config = LauncherConfig::load(config.as_deref()).await?;
            if keep_working_directory {
                config.keep_working_directory = true;
            }

            let request = LaunchRequest::from_files(&descriptor, &job).await?;
            let runner = CwltoolRunner::new(config.runner.clone()).with_args(config.runner_args.clone());

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling launch");
                    trigger.cancel();
                }
            });

            tracing::info!("Launching {}", descriptor.display());
            let outcome = Launcher::new(config, Arc::new(runner))
                .launch(&request, &cancel)
                .await;

            let rendered = serde_json::to_string_pretty(&outcome)?;
            match report {
                Some(path) => {
                    tokio::fs::write(&path, rendered)
                        .await
                        .with_context(|| format!("Failed to write report: {}", path.display()))?;
                    tracing::info!("Report written to {}", path.display());
                }
                None => println!("{}", rendered),
            }

            Ok(if outcome.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Plugins { config } => {
            let config = LauncherConfig::load(config.as_deref()).await?;
            let result = PluginRegistry::load_all(&config.plugins, &config.backends).describe();

            println!("Enabled backends:");
            for descriptor in &result.enabled {
                println!(
                    "  {:<16} {:<8} {:<9} {}",
                    descriptor.name,
                    descriptor.kind,
                    format!("{:?}", descriptor.priority).to_lowercase(),
                    descriptor.handles
                );
            }

            if !result.disabled.is_empty() {
                println!("Disabled backends:");
                for disabled in &result.disabled {
                    println!("  {:<16} {:<8} {}", disabled.name, disabled.kind, disabled.reason);
                }
            }

            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_launch_arguments() {
        let cli = Cli::try_parse_from([
            "launcher",
            "launch",
            "--descriptor",
            "tool.cwl",
            "--job",
            "job.json",
            "--keep-working-directory",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Launch {
                descriptor,
                keep_working_directory,
                report,
                ..
            } => {
                assert_eq!(descriptor, PathBuf::from("tool.cwl"));
                assert!(keep_working_directory);
                assert!(report.is_none());
            }
            _ => panic!("expected launch"),
        }
    }
}
