//! Command-line interface for BLE heart-rate monitors.
//!
//! This crate wires `pulse-core` to the SQLite store in `pulse-store` and
//! exposes the result as the `pulse` binary.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scan` | Scan for nearby heart-rate monitors |
//! | `watch` | Connect to a monitor and stream (and store) live readings |
//! | `history` | Print the readings stored by the last `watch` |
//! | `clear` | Delete all stored readings |
//!
//! # Output Formats
//!
//! - **Text** (default): Human-readable colored output
//! - **JSON**: Machine-readable JSON format
//! - **CSV**: Comma-separated values (`history` only)
//!
//! # Configuration
//!
//! The CLI reads `~/.config/pulse/config.toml` (or platform equivalent):
//!
//! - `device`: Default device name or address for `watch`
//! - `timeout`: Scan timeout in seconds
//! - `connect_timeout`, `discovery_timeout`: BLE timeouts in seconds
//! - `database`: Path of the SQLite database
//! - `store`: Persist readings while watching (default `true`)
//!
//! # Examples
//!
//! ```bash
//! pulse scan
//! pulse watch --device "Polar H10"
//! pulse history --format csv > session.csv
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod format;
pub mod sink;
pub mod style;
pub mod util;

// Re-export core dependencies for convenience
pub use pulse_core;
pub use pulse_store;
pub use pulse_types;
