//! Example: Live Heart Rate
//!
//! Finds a heart-rate monitor, connects, enables notifications and prints
//! every sample for 30 seconds. Samples are kept in an in-memory sink.
//!
//! Run with: `cargo run --example live_heart_rate -- "Polar H10"`

use std::sync::Arc;
use std::time::Duration;

use pulse_core::{
    ConnectionState, EventDispatcher, HeartRateSink, MemorySink, SessionConfig,
    SessionCoordinator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let query = std::env::args().nth(1).unwrap_or_default();
    let sink = Arc::new(MemorySink::new());
    let session = SessionCoordinator::with_bluetooth(
        sink.clone(),
        SessionConfig::default(),
        EventDispatcher::default(),
    )
    .await?;

    println!("Looking for a heart-rate monitor...");
    let strap = session.scanner().find(&query, Duration::from_secs(15)).await?;
    println!("Connecting to {}", strap);

    session.select_device(Some(strap));
    session.connect_active_device()?;
    if let Some(connection) = session.active_connection() {
        connection
            .wait_for_state(Duration::from_secs(20), |s| *s == ConnectionState::Connected)
            .await?;
    }
    session.start_reading().await?;

    let mut view = session.watch_view();
    let watch = async {
        while view.changed().await.is_ok() {
            let current = view.borrow_and_update().clone();
            if let Some(sample) = current.heart_rate {
                println!("{}", sample);
            }
            if let Some(fault) = current.last_error {
                eprintln!("Error: {}", fault);
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(30), watch).await;

    session.stop_reading()?;
    println!("Stored {} readings", sink.get_all().await?.len());
    session.shutdown().await;

    Ok(())
}
