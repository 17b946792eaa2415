//! Local data persistence for heart-rate readings.
//!
//! This crate provides SQLite-based storage for the readings a
//! `pulse-core` session produces while reading is active.
//!
//! # Features
//!
//! - Store heart-rate values with millisecond timestamps
//! - Clear the table when a new reading session starts
//! - Retrieve everything in timestamp order
//! - Export to CSV
//!
//! # Example
//!
//! ```no_run
//! use pulse_store::Store;
//!
//! let store = Store::open_default()?;
//! store.insert(72, 1_700_000_000_000)?;
//! for reading in store.get_all()? {
//!     println!("{} bpm at {}", reading.value, reading.timestamp_millis);
//! }
//! # Ok::<(), pulse_store::Error>(())
//! ```

mod error;
mod schema;
mod store;

pub use error::{Error, Result};
pub use pulse_types::StoredHeartRate;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/pulse/heart_rate.db`
/// - macOS: `~/Library/Application Support/pulse/heart_rate.db`
/// - Windows: `C:\Users\<user>\AppData\Local\pulse\heart_rate.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("pulse")
        .join("heart_rate.db")
}
