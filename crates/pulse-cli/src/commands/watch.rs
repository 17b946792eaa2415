//! Watch command implementation.
//!
//! Finds the requested monitor, connects, refreshes its service catalog and
//! enables heart-rate notifications. Every sample is printed as it arrives
//! and persisted through the session's sink until Ctrl+C or a lost link.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use pulse_core::{
    ConnectionState, DeviceConnection, ErrorKind, EventDispatcher, HeartRateSink, MemorySink,
    SessionConfig, SessionCoordinator, SessionEvent,
};
use pulse_store::Store;
use tokio::sync::broadcast::error::RecvError;

use crate::cli::OutputFormat;
use crate::config::Config;
use crate::format::{FormatOptions, format_sample_json, format_sample_line, format_services_text};
use crate::sink::StoreSink;
use crate::style;

/// Arguments for the watch command.
pub struct WatchArgs<'a> {
    pub device: String,
    pub scan_timeout: Duration,
    pub store: bool,
    pub format: OutputFormat,
    pub quiet: bool,
    pub opts: &'a FormatOptions,
    pub config: &'a Config,
}

async fn wait_for(
    connection: &DeviceConnection,
    wait: Duration,
    target: ConnectionState,
) -> Result<()> {
    let reached = connection
        .wait_for_state(wait, |s| *s == target || *s == ConnectionState::Disconnected)
        .await?;
    if reached != target {
        let reason = connection
            .last_error()
            .map(|f| f.message)
            .unwrap_or_else(|| "disconnected".to_string());
        bail!("{} (while waiting for {})", reason, target);
    }
    Ok(())
}

pub async fn cmd_watch(args: WatchArgs<'_>) -> Result<()> {
    let WatchArgs {
        device,
        scan_timeout,
        store,
        format,
        quiet,
        opts,
        config,
    } = args;

    if format == OutputFormat::Csv {
        bail!("CSV output is only supported by 'history'");
    }

    let sink: Arc<dyn HeartRateSink> = if store {
        let path = config.database_path();
        let store = Store::open(&path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Arc::new(StoreSink::new(store))
    } else {
        Arc::new(MemorySink::new())
    };

    let connection_config = config.connection_config();
    let events = EventDispatcher::default();
    let mut rx = events.subscribe();
    let session = SessionCoordinator::with_bluetooth(
        Arc::clone(&sink),
        SessionConfig {
            connection: connection_config.clone(),
            ..SessionConfig::default()
        },
        events,
    )
    .await
    .context("Bluetooth is not available")?;

    let spinner = (!quiet).then(|| style::scanning_spinner(scan_timeout.as_secs()));
    let found = session.scanner().find(&device, scan_timeout).await;
    if let Some(sp) = &spinner {
        sp.finish_and_clear();
    }
    let peripheral = found.with_context(|| format!("Device '{}' not found", device))?;

    let spinner = (!quiet).then(|| style::connecting_spinner(peripheral.display_name()));
    session.select_device(Some(peripheral.clone()));
    let connection = session
        .active_connection()
        .context("No active connection after selecting the device")?;
    session.connect_active_device()?;
    let connected = wait_for(
        &connection,
        connection_config.connection_timeout + Duration::from_secs(1),
        ConnectionState::Connected,
    )
    .await;
    if let Some(sp) = &spinner {
        sp.finish_and_clear();
    }
    connected.context("Failed to connect")?;

    session.discover_active_device_services()?;
    wait_for(
        &connection,
        connection_config.discovery_timeout + Duration::from_secs(1),
        ConnectionState::Connected,
    )
    .await
    .context("Service discovery failed")?;

    if !quiet {
        let name = peripheral.display_name();
        let header = if opts.no_color {
            format!("Watching: {} ({})", name, peripheral.id)
        } else {
            format!("Watching: {} ({})", name.green(), peripheral.id.cyan())
        };
        eprintln!("{}", header);
        eprint!("{}", format_services_text(&connection.services()));
        eprintln!("Press Ctrl+C to stop");
        eprintln!("{}", "-".repeat(50));
    }

    session.start_reading().await.context("Failed to start reading")?;
    wait_for(
        &connection,
        connection_config.write_timeout + Duration::from_secs(1),
        ConnectionState::Subscribed,
    )
    .await
    .context("Failed to enable notifications")?;

    let outcome = stream_samples(&mut rx, format, quiet, opts).await;

    if let Err(e) = session.stop_reading() {
        tracing::debug!("Stopping reading: {}", e);
    }
    session.shutdown().await;
    if let Some(fault) = session.last_error()
        && fault.kind == ErrorKind::Persistence
    {
        eprintln!("{}", style::format_warning(&fault.message, opts.no_color));
    }

    if !quiet && store {
        let stored = sink.get_all().await.map(|r| r.len()).unwrap_or(0);
        eprintln!(
            "{}",
            style::format_success(&format!("Stored {} reading(s)", stored), opts.no_color)
        );
    }
    outcome
}

async fn stream_samples(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    format: OutputFormat,
    quiet: bool,
    opts: &FormatOptions,
) -> Result<()> {
    let mut previous: Option<u16> = None;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !quiet {
                    eprintln!("\nShutting down...");
                }
                return Ok(());
            }
            event = rx.recv() => event,
        };

        match event {
            Ok(SessionEvent::Sample { sample, .. }) => {
                let line = match format {
                    OutputFormat::Json => format_sample_json(&sample)?,
                    _ => format_sample_line(&sample, previous, opts),
                };
                print!("{}", line);
                previous = Some(sample.bpm);
            }
            Ok(SessionEvent::StateChanged {
                state: ConnectionState::Disconnected,
                ..
            }) => bail!("Connection lost"),
            Ok(SessionEvent::DecodeFailed { error, .. }) => {
                eprintln!("{}", style::format_warning(&error, opts.no_color));
            }
            Ok(SessionEvent::PersistFailed { message }) => {
                eprintln!(
                    "{}",
                    style::format_warning(&format!("Not stored: {}", message), opts.no_color)
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} session events", n),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
