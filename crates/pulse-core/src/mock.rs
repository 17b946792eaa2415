//! In-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without a radio. Tests drive it
//! from the outside: inject advertisements and scan failures, complete or
//! withhold connection and discovery events, push notifications and drop
//! links. Every call the code under test makes is recorded on the link.
//!
//! # Features
//!
//! - **Scripted scans**: [`MockTransport::advertise`] and [`MockTransport::fail_scan`]
//! - **Manual completion**: hold back `Connected` / `ServicesDiscovered` events
//! - **Failure injection**: failing scan starts, opens, connects and writes
//! - **Call recording**: [`MockLink::calls`] lists every transport request

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use pulse_types::{HeartRateSample, PeripheralHandle, ServiceCatalog, codec, uuids};

use crate::error::{Error, Result};
use crate::transport::{Link, LinkEvent, LinkEvents, ScanEvent, ScanEvents, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_failure() -> Error {
    Error::Bluetooth(btleplug::Error::RuntimeError("mock write failure".into()))
}

/// A catalog with the Heart Rate service and its measurement characteristic.
pub fn heart_rate_catalog() -> ServiceCatalog {
    ServiceCatalog::new()
        .with_service(
            uuids::from_short(0x1800),
            vec![uuids::from_short(0x2A00), uuids::from_short(0x2A01)],
        )
        .with_service(
            uuids::HEART_RATE_SERVICE,
            vec![uuids::HEART_RATE_MEASUREMENT, uuids::BODY_SENSOR_LOCATION],
        )
}

/// A transport request recorded by [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// [`Link::connect`].
    Connect,
    /// [`Link::discover_services`].
    DiscoverServices,
    /// [`Link::set_notify`].
    SetNotify {
        /// Target characteristic.
        characteristic: Uuid,
        /// Requested setting.
        enabled: bool,
    },
    /// [`Link::write_descriptor`].
    WriteDescriptor {
        /// Owning characteristic.
        characteristic: Uuid,
        /// Target descriptor.
        descriptor: Uuid,
        /// Written bytes.
        value: Vec<u8>,
    },
    /// [`Link::close`].
    Close,
}

/// A scriptable in-memory [`Transport`].
///
/// # Example
///
/// ```
/// use pulse_core::mock::MockTransport;
/// use pulse_core::transport::{ScanEvent, Transport};
/// use pulse_types::{PeripheralHandle, uuids};
/// use futures::StreamExt;
///
/// #[tokio::main]
/// async fn main() {
///     let transport = MockTransport::new();
///     let mut scan = transport.start_scan(uuids::HEART_RATE_SERVICE).await.unwrap();
///
///     transport.advertise(PeripheralHandle::named("AA:BB", "Strap"), Some(-60));
///     match scan.next().await.unwrap() {
///         ScanEvent::Advertisement { peripheral, .. } => assert_eq!(peripheral.id, "AA:BB"),
///         other => panic!("unexpected {:?}", other),
///     }
/// }
/// ```
pub struct MockTransport {
    scan: Mutex<Option<mpsc::UnboundedSender<ScanEvent>>>,
    scanned_service: Mutex<Option<Uuid>>,
    start_count: AtomicU32,
    stop_count: AtomicU32,
    fail_next_start: Mutex<Option<String>>,
    fail_open: AtomicBool,
    fail_connect: AtomicBool,
    links: Mutex<Vec<Arc<MockLink>>>,
    services: Mutex<ServiceCatalog>,
    auto_connect: AtomicBool,
    auto_discover: AtomicBool,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("scanning", &self.is_scanning())
            .field("links", &lock(&self.links).len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport whose links connect and discover immediately and expose
    /// [`heart_rate_catalog`].
    pub fn new() -> Self {
        Self {
            scan: Mutex::new(None),
            scanned_service: Mutex::new(None),
            start_count: AtomicU32::new(0),
            stop_count: AtomicU32::new(0),
            fail_next_start: Mutex::new(None),
            fail_open: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
            services: Mutex::new(heart_rate_catalog()),
            auto_connect: AtomicBool::new(true),
            auto_discover: AtomicBool::new(true),
        }
    }

    /// Catalog reported by links opened from now on.
    #[must_use]
    pub fn with_services(self, services: ServiceCatalog) -> Self {
        *lock(&self.services) = services;
        self
    }

    /// Links opened from now on wait for [`MockLink::complete_connect`].
    #[must_use]
    pub fn manual_connect(self) -> Self {
        self.auto_connect.store(false, Ordering::Relaxed);
        self
    }

    /// Links opened from now on wait for [`MockLink::complete_discovery`].
    #[must_use]
    pub fn manual_discovery(self) -> Self {
        self.auto_discover.store(false, Ordering::Relaxed);
        self
    }

    /// Deliver an advertisement to the active scan. Returns `false` when no
    /// scan is listening.
    pub fn advertise(&self, peripheral: PeripheralHandle, rssi: Option<i16>) -> bool {
        self.send_scan(ScanEvent::Advertisement { peripheral, rssi })
    }

    /// Abort the active scan with a radio error.
    pub fn fail_scan(&self, message: impl Into<String>) -> bool {
        self.send_scan(ScanEvent::Failed(message.into()))
    }

    fn send_scan(&self, event: ScanEvent) -> bool {
        lock(&self.scan)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Make the next [`Transport::start_scan`] fail.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        *lock(&self.fail_next_start) = Some(message.into());
    }

    /// Make [`Transport::open`] fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Make [`Link::connect`] fail on links opened from now on.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Whether a scan stream is open.
    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).is_some()
    }

    /// Number of successful scan starts.
    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::Relaxed)
    }

    /// Number of scan stops.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::Relaxed)
    }

    /// The service UUID passed to the last scan start.
    pub fn scanned_service(&self) -> Option<Uuid> {
        *lock(&self.scanned_service)
    }

    /// Every link opened so far, oldest first.
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        lock(&self.links).clone()
    }

    /// The most recently opened link.
    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        lock(&self.links).last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(&self, service: Uuid) -> Result<ScanEvents> {
        if let Some(message) = lock(&self.fail_next_start).take() {
            return Err(Error::ScanFailure(message));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.scan) = Some(tx);
        *lock(&self.scanned_service) = Some(service);
        self.start_count.fetch_add(1, Ordering::Relaxed);

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.scan).take();
        Ok(())
    }

    async fn open(&self, peripheral: &PeripheralHandle) -> Result<Arc<dyn Link>> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(Error::connection_lost(&peripheral.id));
        }
        let link = Arc::new(MockLink::new(
            peripheral.clone(),
            lock(&self.services).clone(),
            self.auto_connect.load(Ordering::Relaxed),
            self.auto_discover.load(Ordering::Relaxed),
        ));
        link.set_fail_connect(self.fail_connect.load(Ordering::Relaxed));
        lock(&self.links).push(Arc::clone(&link));
        Ok(link)
    }
}

/// A scriptable in-memory [`Link`].
pub struct MockLink {
    handle: PeripheralHandle,
    tx: mpsc::UnboundedSender<LinkEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    services: Mutex<ServiceCatalog>,
    auto_connect: bool,
    auto_discover: bool,
    calls: Mutex<Vec<LinkCall>>,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    notifying: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("handle", &self.handle)
            .field("notifying", &self.is_notifying())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MockLink {
    fn new(
        handle: PeripheralHandle,
        services: ServiceCatalog,
        auto_connect: bool,
        auto_discover: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle,
            tx,
            rx: Mutex::new(Some(rx)),
            services: Mutex::new(services),
            auto_connect,
            auto_discover,
            calls: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            notifying: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn record(&self, call: LinkCall) {
        lock(&self.calls).push(call);
    }

    /// Push an arbitrary event onto the link's stream.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Report the link as connected with the current catalog.
    pub fn complete_connect(&self) -> bool {
        self.emit(LinkEvent::Connected(lock(&self.services).clone()))
    }

    /// Report service discovery as finished with the current catalog.
    pub fn complete_discovery(&self) -> bool {
        self.emit(LinkEvent::ServicesDiscovered(lock(&self.services).clone()))
    }

    /// Deliver a raw Heart Rate Measurement notification.
    pub fn notify(&self, payload: Vec<u8>) -> bool {
        self.emit(LinkEvent::ValueChanged {
            characteristic: uuids::HEART_RATE_MEASUREMENT,
            value: payload,
        })
    }

    /// Encode and deliver a sample.
    pub fn notify_sample(&self, sample: &HeartRateSample) -> bool {
        self.notify(codec::encode(sample))
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self) -> bool {
        self.emit(LinkEvent::Disconnected)
    }

    /// Replace the catalog reported by later connect and discovery events.
    pub fn set_services(&self, services: ServiceCatalog) {
        *lock(&self.services) = services;
    }

    /// Make [`Link::connect`] fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make notification and descriptor writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Every request made on this link, in order.
    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    /// How many times `call` was made.
    pub fn call_count(&self, call: &LinkCall) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    /// Whether notifications are currently enabled.
    pub fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::Relaxed)
    }

    /// Whether [`Link::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Link for MockLink {
    fn peripheral(&self) -> &PeripheralHandle {
        &self.handle
    }

    async fn events(&self) -> Result<LinkEvents> {
        match lock(&self.rx).take() {
            Some(rx) => {
                Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) })
                    .boxed())
            }
            None => Ok(stream::empty().boxed()),
        }
    }

    async fn connect(&self) -> Result<()> {
        self.record(LinkCall::Connect);
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connection_lost(&self.handle.id));
        }
        if self.auto_connect {
            self.complete_connect();
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.record(LinkCall::DiscoverServices);
        if self.auto_discover {
            self.complete_discovery();
        }
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        self.record(LinkCall::SetNotify {
            characteristic,
            enabled,
        });
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(write_failure());
        }
        self.notifying.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(LinkCall::WriteDescriptor {
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(write_failure());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(LinkCall::Close);
        self.closed.store(true, Ordering::Relaxed);
        self.notifying.store(false, Ordering::Relaxed);
        Ok(())
    }
}
