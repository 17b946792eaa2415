//! Core BLE library for Bluetooth SIG heart-rate monitors.
//!
//! This crate talks to any chest strap, armband or watch that exposes the
//! standard Heart Rate Service (`0x180D`): it discovers peripherals, keeps a
//! GATT session to one of them, decodes Heart Rate Measurement notifications
//! and hands each sample to a persistence sink.
//!
//! # Features
//!
//! - **Device discovery**: Scan for peripherals advertising the Heart Rate Service
//! - **Connection lifecycle**: Connect, discover services, subscribe, disconnect
//! - **Live samples**: Decoded BPM and RR intervals
//! - **Persistence**: Every sample received while reading is stored exactly once
//! - **Observable state**: `tokio::sync::watch` cells and a broadcast event stream
//! - **Testing**: An in-memory transport that scripts the radio
//!
//! # Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Scanner`] | Advertisement discovery, deduplicated by peripheral id |
//! | [`DeviceConnection`] | One peripheral's GATT session and state machine |
//! | [`SessionCoordinator`] | Scanner + active device + sink, published as a [`SessionView`] |
//! | [`Transport`] / [`Link`] | The radio boundary; [`BtleTransport`] or [`MockTransport`] |
//!
//! # Platform Differences
//!
//! On macOS peripherals are identified by a CoreBluetooth UUID that is stable
//! per host but differs between machines. Linux and Windows use the MAC
//! address (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pulse_core::{EventDispatcher, MemorySink, SessionConfig, SessionCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = Arc::new(MemorySink::new());
//!     let session = SessionCoordinator::with_bluetooth(
//!         sink,
//!         SessionConfig::default(),
//!         EventDispatcher::default(),
//!     )
//!     .await?;
//!
//!     let strap = session.scanner().find("Polar", Duration::from_secs(10)).await?;
//!     session.select_device(Some(strap));
//!     session.connect_active_device()?;
//!     session.start_reading().await?;
//!
//!     let mut view = session.watch_view();
//!     while view.changed().await.is_ok() {
//!         if let Some(sample) = &view.borrow().heart_rate {
//!             println!("{} bpm", sample.bpm);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod events;
pub mod mock;
pub mod scan;
pub mod session;
pub mod sink;
pub mod state;
pub mod transport;

// Re-export types and uuid modules from pulse-types
pub use pulse_types::types;
pub use pulse_types::uuids;
pub use pulse_types::{
    ConnectionState, DecodeError, HeartRateSample, PeripheralHandle, ServiceCatalog,
    StoredHeartRate,
};

// Core exports
pub use connection::{ConnectionConfig, DeviceConnection, SampleTap};
pub use error::{Error, ErrorKind, Fault, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use mock::{MockLink, MockTransport};
pub use scan::{ScanOptions, Scanner};
pub use session::{SessionConfig, SessionCoordinator, SessionView};
pub use sink::{HeartRateSink, MemorySink};
pub use state::StateCell;
pub use transport::{BtleTransport, Link, LinkEvent, ScanEvent, Transport};
