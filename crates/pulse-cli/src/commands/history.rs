//! History command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use pulse_store::Store;

use crate::cli::OutputFormat;
use crate::format::{FormatOptions, format_history_json, format_history_text};
use crate::util::write_output;

pub fn cmd_history(
    store: &Store,
    format: OutputFormat,
    output: Option<&PathBuf>,
    opts: &FormatOptions,
) -> Result<()> {
    let content = match format {
        OutputFormat::Text => {
            let records = store.get_all().context("Failed to read stored readings")?;
            format_history_text(&records, opts)
        }
        OutputFormat::Json => {
            let records = store.get_all().context("Failed to read stored readings")?;
            format_history_json(&records, opts)?
        }
        OutputFormat::Csv => {
            let mut buf = Vec::new();
            store
                .export_csv(&mut buf)
                .context("Failed to export readings")?;
            String::from_utf8(buf).context("CSV export produced invalid UTF-8")?
        }
    };
    write_output(output, &content)
}
