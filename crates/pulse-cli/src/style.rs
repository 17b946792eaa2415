//! Visual styling utilities for the CLI.
//!
//! Spinners for long-running BLE operations and colored value formatting.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

// ============================================================================
// Progress Indicators
// ============================================================================

/// Standard spinner tick characters (Braille dots animation)
const SPINNER_TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Standard spinner tick interval
const SPINNER_TICK_MS: u64 = 80;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(SPINNER_TICK_CHARS)
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// Create a spinner for scanning operations.
pub fn scanning_spinner(timeout_secs: u64) -> ProgressBar {
    spinner(format!(
        "Scanning for heart-rate monitors... ({}s)",
        timeout_secs
    ))
}

/// Create a spinner for connecting to a device.
pub fn connecting_spinner(device: &str) -> ProgressBar {
    spinner(format!("Connecting to {}...", device))
}

// ============================================================================
// Colored Value Formatting
// ============================================================================

/// Heart-rate bands used for coloring, in beats per minute.
pub mod bpm {
    /// Below this: resting / light effort.
    pub const LIGHT: u16 = 100;
    /// Below this: moderate effort.
    pub const MODERATE: u16 = 140;
    /// Below this: hard effort; at or above: maximal.
    pub const HARD: u16 = 170;
}

/// Format a BPM value colored by effort band.
pub fn format_bpm_colored(value: u16, no_color: bool) -> String {
    if no_color {
        return format!("{}", value);
    }

    if value < bpm::LIGHT {
        format!("{}", value.green())
    } else if value < bpm::MODERATE {
        format!("{}", value.yellow())
    } else if value < bpm::HARD {
        // Orange color (RGB: 255, 165, 0)
        format!("{}", value.truecolor(255, 165, 0))
    } else {
        format!("{}", value.red())
    }
}

/// Format a success message.
pub fn format_success(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[OK] {}", message)
    } else {
        format!("{} {}", "[OK]".green(), message)
    }
}

/// Format a warning message.
pub fn format_warning(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[!!] {}", message)
    } else {
        format!("{} {}", "[!!]".yellow(), message)
    }
}

/// Trend indicator between two consecutive BPM values.
pub fn trend_indicator(current: u16, previous: u16, no_color: bool) -> &'static str {
    let diff = i32::from(current) - i32::from(previous);
    if diff.abs() < 3 {
        "-"
    } else if diff > 0 {
        if no_color { "^" } else { "↑" }
    } else if no_color {
        "v"
    } else {
        "↓"
    }
}
