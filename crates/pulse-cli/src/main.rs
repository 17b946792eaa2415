use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_cli::cli::{Cli, Commands};
use pulse_cli::commands::{WatchArgs, cmd_clear, cmd_history, cmd_scan, cmd_watch};
use pulse_cli::config::{self, Config, DEFAULT_SCAN_TIMEOUT};
use pulse_cli::format::FormatOptions;
use pulse_cli::util::require_device;
use pulse_store::Store;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(None),
    };
    let opts = FormatOptions::new(cli.no_color);
    let output = cli.output.as_ref();

    match cli.command {
        Commands::Scan { timeout, format } => {
            let timeout = config::resolve_timeout(timeout, &config, DEFAULT_SCAN_TIMEOUT);
            cmd_scan(timeout, format, output, cli.quiet, &opts).await?;
        }
        Commands::Watch {
            device,
            timeout,
            no_store,
            format,
        } => {
            let device = require_device(config::resolve_device(device, &config))?;
            let timeout = config::resolve_timeout(timeout, &config, DEFAULT_SCAN_TIMEOUT);
            cmd_watch(WatchArgs {
                device,
                scan_timeout: Duration::from_secs(timeout),
                store: config.store && !no_store,
                format,
                quiet: cli.quiet,
                opts: &opts,
                config: &config,
            })
            .await?;
        }
        Commands::History { format } => {
            let store = open_store(&config)?;
            cmd_history(&store, format, output, &opts)?;
        }
        Commands::Clear => {
            let store = open_store(&config)?;
            cmd_clear(&store, cli.quiet, cli.no_color)?;
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Store> {
    let path = config.database_path();
    Store::open(&path).with_context(|| format!("Failed to open database {}", path.display()))
}
