//! Example: Scanning for Heart-Rate Monitors
//!
//! This example scans for peripherals advertising the Bluetooth SIG Heart
//! Rate Service and prints each one as it is discovered.
//!
//! Run with: `cargo run --example scan_devices`

use std::sync::Arc;
use std::time::Duration;

use pulse_core::{BtleTransport, EventDispatcher, ScanOptions, Scanner, SessionEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let events = EventDispatcher::default();
    let mut rx = events.subscribe();
    let transport = Arc::new(BtleTransport::new().await?);
    let scanner = Scanner::new(transport, ScanOptions::default(), events);

    println!("Scanning for heart-rate monitors...");
    println!();

    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let SessionEvent::Discovered { peripheral, rssi } = event {
                let rssi = rssi
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} [{}] RSSI: {}", peripheral.display_name(), peripheral.id, rssi);
            }
        }
    });

    let devices = scanner.scan_for(Duration::from_secs(10)).await?;
    printer.abort();

    println!();
    if devices.is_empty() {
        println!("No heart-rate monitors found.");
        println!();
        println!("Make sure:");
        println!("  - The strap is worn or its contacts are moistened");
        println!("  - Bluetooth is enabled on this computer");
        println!("  - The strap is not connected to a phone or watch");
    } else {
        println!("Found {} device(s).", devices.len());
    }

    Ok(())
}
