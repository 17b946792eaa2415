//! Scan command implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pulse_core::{BtleTransport, EventDispatcher, ScanOptions, Scanner};

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_scan_json, format_scan_text};
use crate::style;
use crate::util::write_output;

pub async fn cmd_scan(
    timeout: u64,
    format: OutputFormat,
    output: Option<&PathBuf>,
    quiet: bool,
    opts: &FormatOptions,
) -> Result<()> {
    if format == OutputFormat::Csv {
        bail!("CSV output is only supported by 'history'");
    }

    let transport = BtleTransport::new()
        .await
        .context("Bluetooth is not available")?;
    let scanner = Scanner::new(
        Arc::new(transport),
        ScanOptions::default(),
        EventDispatcher::default(),
    );

    // Show spinner for text output (unless quiet)
    let spinner = if !quiet && format == OutputFormat::Text {
        Some(style::scanning_spinner(timeout))
    } else {
        None
    };

    let devices = scanner
        .scan_for(Duration::from_secs(timeout))
        .await
        .context("Failed to scan for devices")?;

    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }

    let content = match format {
        OutputFormat::Json => format_scan_json(&devices, opts)?,
        _ => format_scan_text(&devices, opts),
    };
    write_output(output, &content)
}
