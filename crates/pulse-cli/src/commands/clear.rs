//! Clear command implementation.

use anyhow::{Context, Result};
use pulse_store::Store;

use crate::style;

pub fn cmd_clear(store: &Store, quiet: bool, no_color: bool) -> Result<usize> {
    let removed = store
        .delete_all()
        .context("Failed to delete stored readings")?;
    if !quiet {
        eprintln!(
            "{}",
            style::format_success(&format!("Deleted {} reading(s)", removed), no_color)
        );
    }
    Ok(removed)
}
