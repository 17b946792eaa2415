//! Integration tests for pulse-core against the in-memory transport.
//!
//! These exercise the scanner, connection and coordinator together without
//! a radio. Hardware tests live in `hardware_tests.rs`.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::mock::{LinkCall, MockTransport};
use pulse_core::{
    ConnectionState, ErrorKind, EventDispatcher, HeartRateSample, HeartRateSink, MemorySink,
    PeripheralHandle, ScanOptions, ServiceCatalog, SessionConfig, SessionCoordinator,
    SessionEvent, SessionView, uuids,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    transport: Arc<MockTransport>,
    sink: Arc<MemorySink>,
    events: EventDispatcher,
    session: SessionCoordinator,
}

fn harness_from(transport: MockTransport, sink: MemorySink, config: SessionConfig) -> Harness {
    let transport = Arc::new(transport);
    let sink = Arc::new(sink);
    let events = EventDispatcher::default();
    let session = SessionCoordinator::new(transport.clone(), sink.clone(), config, events.clone());
    Harness {
        transport,
        sink,
        events,
        session,
    }
}

fn harness_with(transport: MockTransport) -> Harness {
    harness_from(transport, MemorySink::new(), SessionConfig::default())
}

fn harness() -> Harness {
    harness_with(MockTransport::new())
}

/// A harness whose sink takes `delay` per insert.
fn slow_harness(delay: Duration, config: SessionConfig) -> Harness {
    harness_from(
        MockTransport::new(),
        MemorySink::new().with_insert_delay(delay),
        config,
    )
}

fn strap() -> PeripheralHandle {
    PeripheralHandle::named("AA:BB:CC:DD:EE:FF", "Polar H10 1234")
}

async fn wait_view<F>(session: &SessionCoordinator, predicate: F) -> SessionView
where
    F: FnMut(&SessionView) -> bool,
{
    let mut rx = session.watch_view();
    timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("view did not reach the expected state")
        .unwrap()
        .clone()
}

async fn wait_state(session: &SessionCoordinator, state: ConnectionState) {
    session
        .active_connection()
        .unwrap()
        .wait_for_state(WAIT, |s| *s == state)
        .await
        .unwrap();
}

async fn wait_persisted(h: &Harness, count: usize) {
    timeout(WAIT, async {
        while h.sink.len().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("samples were not persisted");
}

async fn wait_latest(session: &SessionCoordinator, bpm: u16) {
    let connection = session.active_connection().unwrap();
    let mut latest = connection.watch_latest_sample();
    timeout(WAIT, latest.wait_for(|s| s.as_ref().is_some_and(|s| s.bpm == bpm)))
        .await
        .expect("sample was not received")
        .unwrap();
}

async fn stored_values(h: &Harness) -> Vec<u16> {
    h.sink
        .get_all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.value)
        .collect()
}

async fn reading(h: &Harness) {
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;
    h.session.start_reading().await.unwrap();
    wait_state(&h.session, ConnectionState::Subscribed).await;
}

// ==================== Scanning ====================

#[tokio::test]
async fn test_scan_twice_keeps_single_entries() {
    let h = harness();
    h.session.start_scanning().await.unwrap();
    h.transport.advertise(strap(), Some(-60));
    wait_view(&h.session, |v| v.found_devices.len() == 1).await;

    h.session.start_scanning().await.unwrap();
    assert!(h.session.scanner().is_scanning());
    h.transport.advertise(strap(), Some(-55));
    h.transport
        .advertise(PeripheralHandle::named("11:22:33:44:55:66", "Wahoo TICKR"), None);

    let view = wait_view(&h.session, |v| v.found_devices.len() == 2).await;
    assert!(view.is_scanning);
    let strap_entries = view
        .found_devices
        .iter()
        .filter(|p| p.id == strap().id)
        .count();
    assert_eq!(strap_entries, 1);
    assert_eq!(h.transport.start_count(), 2);
}

#[tokio::test]
async fn test_scan_filters_on_heart_rate_service() {
    let h = harness();
    h.session.start_scanning().await.unwrap();
    assert_eq!(
        h.transport.scanned_service(),
        Some(uuids::HEART_RATE_SERVICE)
    );
}

#[tokio::test]
async fn test_scan_failure_clears_scanning_flag() {
    let h = harness();
    let mut events = h.events.subscribe();
    h.session.start_scanning().await.unwrap();
    h.transport.fail_scan("adapter powered off");

    let view = wait_view(&h.session, |v| !v.is_scanning && v.last_error.is_some()).await;
    assert_eq!(view.last_error.unwrap().kind, ErrorKind::ScanFailure);

    let failed = timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::ScanFailed { message }) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(failed.contains("adapter powered off"));
}

#[tokio::test]
async fn test_start_scan_refused() {
    let h = harness();
    h.transport.fail_next_start("bluetooth disabled");
    assert!(h.session.start_scanning().await.is_err());
    assert!(!h.session.scanner().is_scanning());
    assert!(h.session.scanner().last_error().is_some());
}

#[tokio::test]
async fn test_clear_on_start_forgets_previous_results() {
    let transport = Arc::new(MockTransport::new());
    let session = SessionCoordinator::new(
        transport.clone(),
        Arc::new(MemorySink::new()),
        SessionConfig {
            scan: ScanOptions::new().clear_on_start(true),
            ..SessionConfig::default()
        },
        EventDispatcher::default(),
    );
    session.start_scanning().await.unwrap();
    transport.advertise(strap(), None);
    wait_view(&session, |v| v.found_devices.len() == 1).await;

    session.start_scanning().await.unwrap();
    wait_view(&session, |v| v.found_devices.is_empty()).await;
}

// ==================== Connection lifecycle ====================

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let h = harness();
    h.session.select_device(Some(strap()));
    h.session.disconnect_active_device().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let view = h.session.view();
    assert_eq!(view.connection_state, ConnectionState::Disconnected);
    assert!(view.last_error.is_none());
    assert!(h.transport.links().is_empty());
}

#[tokio::test]
async fn test_late_connect_after_disconnect_is_ignored() {
    let h = harness_with(MockTransport::new().manual_connect());
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connecting).await;

    // Wait for the link to be opened before racing it.
    timeout(WAIT, async {
        while h.transport.last_link().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let link = h.transport.last_link().unwrap();

    h.session.disconnect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Disconnected).await;
    link.complete_connect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let connection = h.session.active_connection().unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.services().is_empty());
}

#[tokio::test]
async fn test_connect_then_discover_refreshes_catalog() {
    let h = harness_with(MockTransport::new().manual_discovery());
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;

    h.session.discover_active_device_services().unwrap();
    wait_state(&h.session, ConnectionState::Discovering).await;

    let link = h.transport.last_link().unwrap();
    link.set_services(ServiceCatalog::new().with_service(
        uuids::HEART_RATE_SERVICE,
        vec![uuids::HEART_RATE_MEASUREMENT],
    ));
    link.complete_discovery();

    let view = wait_view(&h.session, |v| {
        v.connection_state == ConnectionState::Connected && v.services.len() == 1
    })
    .await;
    assert!(view.services.contains_key(&uuids::HEART_RATE_SERVICE.to_string()));
}

#[tokio::test]
async fn test_peripheral_drop_reports_connection_lost() {
    let h = harness();
    reading(&h).await;

    h.transport.last_link().unwrap().drop_link();

    let view = wait_view(&h.session, |v| {
        v.connection_state == ConnectionState::Disconnected && v.last_error.is_some()
    })
    .await;
    assert_eq!(view.last_error.unwrap().kind, ErrorKind::ConnectionLost);
    assert!(view.services.is_empty());
}

#[tokio::test]
async fn test_reselect_disconnects_previous_device() {
    let h = harness();
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;
    let first = h.transport.last_link().unwrap();

    let other = PeripheralHandle::named("11:22:33:44:55:66", "Wahoo TICKR");
    h.session.select_device(Some(other.clone()));

    timeout(WAIT, async {
        while !first.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("previous link was not closed");

    let view = wait_view(&h.session, |v| v.active_device.as_ref() == Some(&other)).await;
    assert_eq!(view.connection_state, ConnectionState::Disconnected);
}

// ==================== Subscriptions ====================

#[tokio::test]
async fn test_missing_measurement_characteristic() {
    let catalog = ServiceCatalog::new().with_service(uuids::HEART_RATE_SERVICE, vec![]);
    let h = harness_with(MockTransport::new().with_services(catalog));
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;

    h.session.start_reading().await.unwrap();

    let view = wait_view(&h.session, |v| v.last_error.is_some()).await;
    assert_eq!(
        view.last_error.unwrap().kind,
        ErrorKind::CharacteristicNotFound
    );
    assert_eq!(view.connection_state, ConnectionState::Connected);
    assert!(!h.transport.last_link().unwrap().is_notifying());
}

#[tokio::test]
async fn test_stop_reading_writes_disable_descriptor() {
    let h = harness();
    reading(&h).await;

    h.session.stop_reading().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;

    let link = h.transport.last_link().unwrap();
    assert!(!link.is_notifying());
    assert_eq!(
        link.call_count(&LinkCall::WriteDescriptor {
            characteristic: uuids::HEART_RATE_MEASUREMENT,
            descriptor: uuids::CLIENT_CHARACTERISTIC_CONFIG,
            value: uuids::DISABLE_NOTIFICATION_VALUE.to_vec(),
        }),
        1
    );
}

// ==================== Samples and persistence ====================

#[tokio::test]
async fn test_samples_are_displayed_and_persisted() {
    let h = harness();
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify(vec![0x00, 0x48]);
    let view = wait_view(&h.session, |v| v.heart_rate.is_some()).await;
    assert_eq!(view.heart_rate.unwrap().bpm, 72);

    wait_persisted(&h, 1).await;
    let stored = h.sink.get_all().await.unwrap();
    assert_eq!(stored[0].value, 72);
}

#[tokio::test]
async fn test_decode_failure_keeps_previous_sample() {
    let h = harness();
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify_sample(&HeartRateSample::new(64));
    wait_view(&h.session, |v| v.heart_rate.as_ref().is_some_and(|s| s.bpm == 64)).await;

    link.notify(vec![0x01, 0x48]);
    let view = wait_view(&h.session, |v| v.last_error.is_some()).await;
    assert_eq!(view.last_error.unwrap().kind, ErrorKind::Decode);
    assert_eq!(view.heart_rate.unwrap().bpm, 64);

    wait_persisted(&h, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.sink.len().await, 1);
}

#[tokio::test]
async fn test_reading_toggle_does_not_duplicate_inserts() {
    let h = harness();
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify(vec![0x00, 0x50]);
    wait_persisted(&h, 1).await;

    h.session.stop_reading().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;
    // Notifications off on our side; anything still delivered is not stored.
    link.notify(vec![0x00, 0x51]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.sink.len().await, 1);

    h.session.start_reading().await.unwrap();
    wait_state(&h.session, ConnectionState::Subscribed).await;
    // Starting to read clears the store.
    assert_eq!(h.sink.len().await, 0);

    link.notify(vec![0x00, 0x52]);
    wait_persisted(&h, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stored = h.sink.get_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].value, 0x52);
}

#[tokio::test]
async fn test_persist_failure_is_published() {
    let h = harness();
    reading(&h).await;
    h.sink.set_should_fail(true);

    h.transport.last_link().unwrap().notify(vec![0x00, 0x48]);

    let view = wait_view(&h.session, |v| v.last_error.is_some()).await;
    assert_eq!(view.last_error.unwrap().kind, ErrorKind::Persistence);
    // The live display keeps working.
    assert_eq!(view.heart_rate.map(|s| s.bpm), Some(72));
}

#[tokio::test]
async fn test_heart_rate_hidden_when_not_reading() {
    let h = harness();
    h.session.select_device(Some(strap()));
    h.session.connect_active_device().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;

    h.transport.last_link().unwrap().notify(vec![0x00, 0x48]);
    let connection = h.session.active_connection().unwrap();
    let mut latest = connection.watch_latest_sample();
    timeout(WAIT, latest.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();

    assert!(h.session.view().heart_rate.is_none());
    assert!(h.sink.is_empty().await);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = harness();
    h.session.start_scanning().await.unwrap();
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    h.session.shutdown().await;

    assert!(!h.transport.is_scanning());
    assert!(h.session.active_device().is_none());
    timeout(WAIT, async {
        while !link.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ==================== Slow sinks ====================

#[tokio::test(start_paused = true)]
async fn test_slow_sink_stores_samples_accepted_before_stop() {
    let h = slow_harness(Duration::from_millis(100), SessionConfig::default());
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify(vec![0x00, 0x50]);
    link.notify(vec![0x00, 0x51]);
    wait_latest(&h.session, 0x51).await;
    h.session.stop_reading().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(stored_values(&h).await, vec![0x50, 0x51]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_clears_queued_samples_and_skips_inactive_ones() {
    let h = slow_harness(Duration::from_millis(100), SessionConfig::default());
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify(vec![0x00, 0x50]);
    link.notify(vec![0x00, 0x51]);
    wait_latest(&h.session, 0x51).await;
    h.session.stop_reading().unwrap();
    wait_state(&h.session, ConnectionState::Connected).await;

    // Arrives while reading is off.
    link.notify(vec![0x00, 0x60]);
    wait_latest(&h.session, 0x60).await;

    h.session.start_reading().await.unwrap();
    assert!(h.sink.is_empty().await);
    wait_state(&h.session, ConnectionState::Subscribed).await;

    link.notify(vec![0x00, 0x61]);
    wait_persisted(&h, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(stored_values(&h).await, vec![0x61]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_accepted_samples() {
    let h = slow_harness(Duration::from_millis(100), SessionConfig::default());
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    for bpm in [0x50, 0x51, 0x52] {
        link.notify(vec![0x00, bpm]);
    }
    wait_latest(&h.session, 0x52).await;

    h.session.shutdown().await;
    assert_eq!(stored_values(&h).await, vec![0x50, 0x51, 0x52]);
    assert!(h.session.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reports_samples_left_in_queue() {
    let config = SessionConfig {
        drain_timeout: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let h = slow_harness(Duration::from_secs(1), config);
    let mut events = h.events.subscribe();
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    for bpm in [0x50, 0x51, 0x52] {
        link.notify(vec![0x00, bpm]);
    }
    wait_latest(&h.session, 0x52).await;
    h.session.shutdown().await;

    let message = timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::PersistFailed { message }) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("dropped samples were not reported");
    assert!(message.contains("2 queued samples"));

    let fault = h.session.last_error().unwrap();
    assert_eq!(fault.kind, ErrorKind::Persistence);
    assert_eq!(stored_values(&h).await, vec![0x50]);
}

#[tokio::test(start_paused = true)]
async fn test_reselect_keeps_samples_of_previous_device() {
    let h = slow_harness(Duration::from_millis(100), SessionConfig::default());
    reading(&h).await;
    let link = h.transport.last_link().unwrap();

    link.notify(vec![0x00, 0x50]);
    link.notify(vec![0x00, 0x51]);
    wait_latest(&h.session, 0x51).await;

    h.session
        .select_device(Some(PeripheralHandle::named("11:22:33:44:55:66", "Wahoo TICKR")));
    assert!(!h.session.is_reading());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(stored_values(&h).await, vec![0x50, 0x51]);
}
