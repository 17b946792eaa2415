//! Platform-agnostic types for BLE heart-rate monitors.
//!
//! This crate holds everything about the Heart Rate service that does not
//! need a Bluetooth stack: the data model shared by the scanner, connection
//! and store crates, the Heart Rate Measurement codec, and the well-known
//! UUIDs.
//!
//! # Features
//!
//! - Heart Rate Measurement (0x2A37) decoding with bounds-checked reads
//! - Encoding of the same format, used by the mock transport and tests
//! - Peripheral, connection state and service catalog types
//! - UUID constants for the Heart Rate service
//!
//! # Example
//!
//! ```
//! use pulse_types::{codec, HeartRateSample};
//!
//! let sample = codec::decode(&[0x10, 0x48, 0x00, 0x04]).unwrap();
//! assert_eq!(sample.bpm, 72);
//! assert_eq!(sample.rr_intervals, vec![1.0]);
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use codec::{decode, encode};
pub use error::{DecodeError, DecodeResult};
pub use types::{ConnectionState, HeartRateSample, PeripheralHandle, ServiceCatalog, StoredHeartRate};
pub use uuid as uuids;
