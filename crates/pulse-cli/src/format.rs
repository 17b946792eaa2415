//! Output formatting utilities for text, JSON, and CSV output.

use anyhow::Result;
use pulse_types::{HeartRateSample, PeripheralHandle, ServiceCatalog, StoredHeartRate, uuids};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::style;

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Use compact JSON output (no pretty-printing).
    pub compact: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool) -> Self {
        Self {
            no_color,
            compact: false,
        }
    }

    /// Create with compact JSON option.
    pub fn with_compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Serialize to JSON honoring the compact setting.
    pub fn as_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        Ok(json + "\n")
    }
}

fn rfc3339_millis(timestamp_millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_millis) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp_millis.to_string())
}

// ============================================================================
// Scan formatting
// ============================================================================

#[must_use]
pub fn format_scan_text(devices: &[PeripheralHandle], opts: &FormatOptions) -> String {
    if devices.is_empty() {
        return "No heart-rate monitors found.\n".to_string();
    }
    let mut output = format!("Found {} heart-rate monitor(s):\n\n", devices.len());
    for device in devices {
        let name = device.name.as_deref().unwrap_or("(unnamed)");
        output.push_str(&format!("  {:<24} {}\n", name, device.id));
    }
    if !opts.no_color {
        output.push('\n');
        output.push_str("Connect with: pulse watch --device <NAME|ADDRESS>\n");
    }
    output
}

pub fn format_scan_json(devices: &[PeripheralHandle], opts: &FormatOptions) -> Result<String> {
    #[derive(Serialize)]
    struct ScanResult<'a> {
        count: usize,
        devices: &'a [PeripheralHandle],
    }

    opts.as_json(&ScanResult {
        count: devices.len(),
        devices,
    })
}

// ============================================================================
// Live sample formatting
// ============================================================================

/// One text line per sample, with a trend against the previous value.
#[must_use]
pub fn format_sample_line(
    sample: &HeartRateSample,
    previous: Option<u16>,
    opts: &FormatOptions,
) -> String {
    let time = sample
        .timestamp_millis()
        .map(rfc3339_millis)
        .unwrap_or_default();
    let trend = previous
        .map(|p| style::trend_indicator(sample.bpm, p, opts.no_color))
        .unwrap_or(" ");
    let mut line = format!(
        "{}  {} {} bpm",
        time,
        trend,
        style::format_bpm_colored(sample.bpm, opts.no_color)
    );
    if !sample.rr_intervals.is_empty() {
        let rr: Vec<String> = sample
            .rr_intervals
            .iter()
            .map(|s| format!("{:.0}ms", s * 1000.0))
            .collect();
        line.push_str(&format!("  RR {}", rr.join(" ")));
    }
    line.push('\n');
    line
}

/// One compact JSON object per sample.
pub fn format_sample_json(sample: &HeartRateSample) -> Result<String> {
    Ok(serde_json::to_string(sample)? + "\n")
}

/// Service catalog with well-known names.
#[must_use]
pub fn format_services_text(catalog: &ServiceCatalog) -> String {
    let mut output = String::new();
    for (service, characteristics) in catalog.iter() {
        let name = uuids::short_name(service).unwrap_or("");
        output.push_str(&format!("  {} {}\n", service, name));
        for characteristic in characteristics {
            let name = uuids::short_name(characteristic).unwrap_or("");
            output.push_str(&format!("    - {} {}\n", characteristic, name));
        }
    }
    output
}

// ============================================================================
// History formatting
// ============================================================================

#[must_use]
pub fn format_history_text(records: &[StoredHeartRate], opts: &FormatOptions) -> String {
    if records.is_empty() {
        return "No stored readings.\n".to_string();
    }
    let mut output = format!("{:<30} {:>5}\n", "Time", "BPM");
    output.push_str(&format!("{}\n", "-".repeat(36)));
    for record in records {
        output.push_str(&format!(
            "{:<30} {:>5}\n",
            rfc3339_millis(record.timestamp_millis),
            style::format_bpm_colored(record.value, opts.no_color)
        ));
    }

    let count = records.len();
    let sum: u64 = records.iter().map(|r| u64::from(r.value)).sum();
    let min = records.iter().map(|r| r.value).min().unwrap_or(0);
    let max = records.iter().map(|r| r.value).max().unwrap_or(0);
    output.push_str(&format!(
        "\n{} readings, avg {} bpm, min {}, max {}\n",
        count,
        sum / count as u64,
        min,
        max
    ));
    output
}

pub fn format_history_json(records: &[StoredHeartRate], opts: &FormatOptions) -> Result<String> {
    #[derive(Serialize)]
    struct RecordJson {
        value: u16,
        timestamp_ms: i64,
        captured_at: String,
    }

    let rows: Vec<RecordJson> = records
        .iter()
        .map(|r| RecordJson {
            value: r.value,
            timestamp_ms: r.timestamp_millis,
            captured_at: rfc3339_millis(r.timestamp_millis),
        })
        .collect();
    opts.as_json(&rows)
}
