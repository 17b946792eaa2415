//! The session coordinator.
//!
//! [`SessionCoordinator`] combines the [`Scanner`] with at most one
//! [`DeviceConnection`] and publishes a single [`SessionView`] for a UI or
//! CLI to render. While reading is active, each decoded sample is handed to
//! the [`HeartRateSink`] exactly once.
//!
//! Whether a sample is persisted is decided by the connection task when the
//! sample arrives, not when the sink gets to it. Accepted samples and sink
//! clears share one ordered queue per device, so a slow sink never reorders
//! them and releasing a device lets the queue drain.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use pulse_types::{ConnectionState, HeartRateSample, PeripheralHandle, ServiceCatalog};

use crate::connection::{ConnectionConfig, DeviceConnection};
use crate::error::{Error, Fault, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::scan::{ScanOptions, Scanner};
use crate::sink::HeartRateSink;
use crate::state::StateCell;
use crate::transport::{BtleTransport, Transport};

/// How long [`SessionCoordinator::shutdown`] waits for queued samples.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`SessionCoordinator`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scanner options.
    pub scan: ScanOptions,
    /// Timeouts for each device connection.
    pub connection: ConnectionConfig,
    /// How long shutdown waits for accepted samples to reach the sink.
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            connection: ConnectionConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Everything a consumer renders, as one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    /// Whether a scan is active.
    pub is_scanning: bool,
    /// Discovered peripherals that advertise a name.
    pub found_devices: Vec<PeripheralHandle>,
    /// The selected peripheral.
    pub active_device: Option<PeripheralHandle>,
    /// The selected peripheral's connection state.
    pub connection_state: ConnectionState,
    /// Whether samples are being displayed and persisted.
    pub is_reading: bool,
    /// Service catalog of the selected peripheral, as strings.
    pub services: BTreeMap<String, Vec<String>>,
    /// Latest sample; `None` unless reading.
    pub heart_rate: Option<HeartRateSample>,
    /// Most recent failure from any component.
    pub last_error: Option<Fault>,
}

enum PersistJob {
    Insert(HeartRateSample),
    Clear(oneshot::Sender<Result<()>>),
}

#[derive(Clone)]
struct ActiveDevice {
    connection: Arc<DeviceConnection>,
    jobs: mpsc::UnboundedSender<PersistJob>,
}

/// Composes the scanner and the active connection.
///
/// Must be created within a Tokio runtime.
pub struct SessionCoordinator {
    transport: Arc<dyn Transport>,
    scanner: Scanner,
    sink: Arc<dyn HeartRateSink>,
    events: EventDispatcher,
    config: ConnectionConfig,
    drain_timeout: Duration,
    active: StateCell<Option<ActiveDevice>>,
    reading: StateCell<bool>,
    last_error: Arc<StateCell<Option<Fault>>>,
    view: Arc<StateCell<SessionView>>,
    // Serializes select/disconnect so two selections cannot interleave.
    select_lock: Mutex<()>,
    persist_tasks: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("scanner", &self.scanner)
            .field("active_device", &self.active_device())
            .field("is_reading", &self.is_reading())
            .finish()
    }
}

impl SessionCoordinator {
    /// Create a coordinator over `transport`, persisting into `sink`.
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn HeartRateSink>,
        config: SessionConfig,
        events: EventDispatcher,
    ) -> Self {
        let scanner = Scanner::new(Arc::clone(&transport), config.scan, events.clone());
        let coordinator = Self {
            transport,
            scanner,
            sink,
            events,
            config: config.connection,
            drain_timeout: config.drain_timeout,
            active: StateCell::new(None),
            reading: StateCell::new(false),
            last_error: Arc::new(StateCell::new(None)),
            view: Arc::new(StateCell::default()),
            select_lock: Mutex::new(()),
            persist_tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        };
        coordinator.spawn_view_task();
        coordinator
    }

    /// Create a coordinator over the system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// [`Error::TransportUnavailable`] when there is no usable adapter.
    pub async fn with_bluetooth(
        sink: Arc<dyn HeartRateSink>,
        config: SessionConfig,
        events: EventDispatcher,
    ) -> Result<Self> {
        let transport = BtleTransport::new().await?;
        Ok(Self::new(Arc::new(transport), sink, config, events))
    }

    fn select_guard(&self) -> MutexGuard<'_, ()> {
        self.select_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The scanner.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Start scanning for peripherals.
    pub async fn start_scanning(&self) -> Result<()> {
        self.scanner.start_scanning().await
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.scanner.stop_scanning().await
    }

    /// Select a peripheral, or clear the selection with `None`.
    ///
    /// Any previous connection is disconnected and shut down first; samples
    /// it already accepted are still written to the sink in the background.
    /// A fresh [`DeviceConnection`] is created for the new peripheral. The new
    /// connection is not connected until
    /// [`SessionCoordinator::connect_active_device`].
    #[tracing::instrument(level = "info", skip_all, fields(peripheral = ?peripheral.as_ref().map(|p| &p.id)))]
    pub fn select_device(&self, peripheral: Option<PeripheralHandle>) {
        let _guard = self.select_guard();

        if let Some(previous) = self.active.get() {
            debug!(peripheral = %previous.connection.peripheral(), "Releasing previous device");
            self.reading.set_if_changed(false);
            let _ = previous.connection.disconnect();
            previous.connection.shutdown();
        }

        let Some(peripheral) = peripheral else {
            self.active.set(None);
            return;
        };

        info!("Selected {}", peripheral);
        let (jobs, queue) = mpsc::unbounded_channel();
        let reading = self.reading.subscribe();
        let accepted = jobs.clone();
        let connection = Arc::new(DeviceConnection::with_sample_tap(
            Arc::clone(&self.transport),
            peripheral,
            self.config.clone(),
            self.events.clone(),
            Box::new(move |sample: &HeartRateSample| {
                if *reading.borrow() {
                    let _ = accepted.send(PersistJob::Insert(sample.clone()));
                }
            }),
        ));
        self.persist_tasks.spawn(persist_samples(
            queue,
            Arc::clone(&self.sink),
            self.events.clone(),
            Arc::clone(&self.last_error),
            self.cancel.clone(),
        ));
        self.active.set(Some(ActiveDevice { connection, jobs }));
    }

    /// The selected peripheral.
    pub fn active_device(&self) -> Option<PeripheralHandle> {
        self.active
            .borrow()
            .as_ref()
            .map(|a| a.connection.peripheral().clone())
    }

    /// The selected peripheral's connection.
    pub fn active_connection(&self) -> Option<Arc<DeviceConnection>> {
        self.active
            .borrow()
            .as_ref()
            .map(|a| Arc::clone(&a.connection))
    }

    fn require_active(&self) -> Result<Arc<DeviceConnection>> {
        self.active_connection().ok_or(Error::NoDeviceSelected)
    }

    /// Connect the selected peripheral.
    pub fn connect_active_device(&self) -> Result<()> {
        self.require_active()?.connect()
    }

    /// Disconnect the selected peripheral and stop reading. Does nothing
    /// when no device is selected.
    pub fn disconnect_active_device(&self) -> Result<()> {
        self.reading.set_if_changed(false);
        match self.active_connection() {
            Some(connection) => connection.disconnect(),
            None => Ok(()),
        }
    }

    /// Refresh the selected peripheral's service catalog.
    pub fn discover_active_device_services(&self) -> Result<()> {
        self.require_active()?.discover_services()
    }

    /// Clear the sink, enable notifications and start persisting samples.
    ///
    /// The clear is queued behind samples still waiting for the sink, so
    /// nothing from an earlier reading survives it.
    ///
    /// # Errors
    ///
    /// [`Error::NoDeviceSelected`], or the sink's error when clearing fails
    /// (reading is then left off).
    pub async fn start_reading(&self) -> Result<()> {
        let active = self.active.get().ok_or(Error::NoDeviceSelected)?;
        let (reply, cleared) = oneshot::channel();
        let cleared = match active.jobs.send(PersistJob::Clear(reply)) {
            Ok(()) => cleared.await.unwrap_or_else(|_| Err(Error::Cancelled)),
            Err(_) => Err(Error::Cancelled),
        };
        if let Err(e) = cleared {
            self.publish_error(&e);
            return Err(e);
        }
        active.connection.subscribe_heart_rate()?;
        self.reading.set_if_changed(true);
        info!("Reading started");
        Ok(())
    }

    /// Disable notifications and stop persisting samples.
    pub fn stop_reading(&self) -> Result<()> {
        self.reading.set_if_changed(false);
        if let Some(connection) = self.active_connection() {
            connection.unsubscribe_heart_rate()?;
        }
        info!("Reading stopped");
        Ok(())
    }

    /// Whether samples are being displayed and persisted.
    pub fn is_reading(&self) -> bool {
        *self.reading.borrow()
    }

    /// The current view.
    pub fn view(&self) -> SessionView {
        self.view.get()
    }

    /// Observe the view.
    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    /// Most recent failure from any component.
    pub fn last_error(&self) -> Option<Fault> {
        self.last_error.get()
    }

    /// The sink readings are persisted to.
    pub fn sink(&self) -> &Arc<dyn HeartRateSink> {
        &self.sink
    }

    fn publish_error(&self, err: &Error) {
        self.last_error.set(Some(Fault::from(err)));
        self.events.send(SessionEvent::error(None, err));
    }

    /// Stop scanning, release the selected device and stop background tasks.
    ///
    /// Samples accepted while reading was active are written to the sink
    /// first, for up to [`SessionConfig::drain_timeout`]. Whatever is still
    /// queued after that is dropped and reported through
    /// [`SessionCoordinator::last_error`].
    pub async fn shutdown(&self) {
        if let Err(e) = self.scanner.stop_scanning().await {
            debug!("Stopping scan during shutdown: {}", e);
        }
        self.select_device(None);
        self.persist_tasks.close();
        if timeout(self.drain_timeout, self.persist_tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Samples still queued after {:?}, giving up on them",
                self.drain_timeout
            );
        }
        self.cancel.cancel();
    }

    fn spawn_view_task(&self) {
        let task = ViewTask {
            scanning: self.scanner.watch_scanning(),
            discovered: self.scanner.watch_discovered(),
            scan_error: self.scanner.watch_last_error(),
            active: self.active.subscribe(),
            reading: self.reading.subscribe(),
            own_error: self.last_error.subscribe(),
            last_error: Arc::clone(&self.last_error),
            view: Arc::clone(&self.view),
        };
        tokio::spawn(task.run(self.cancel.clone()));
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(active) = self.active.get() {
            active.connection.shutdown();
        }
    }
}

// Runs until every sender is gone and the queue is empty, or until cancelled.
async fn persist_samples(
    mut queue: mpsc::UnboundedReceiver<PersistJob>,
    sink: Arc<dyn HeartRateSink>,
    events: EventDispatcher,
    last_error: Arc<StateCell<Option<Fault>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.recv() => job,
        };
        match job {
            Some(PersistJob::Insert(sample)) => {
                persist(&sample, sink.as_ref(), &events, &last_error).await;
            }
            Some(PersistJob::Clear(reply)) => {
                let result = sink.delete_all().await;
                if result.is_ok() {
                    debug!("Sink cleared");
                }
                let _ = reply.send(result);
            }
            None => return,
        }
    }

    queue.close();
    let mut dropped = 0usize;
    while let Ok(job) = queue.try_recv() {
        if matches!(job, PersistJob::Insert(_)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        let err = Error::persistence(format!("{} queued samples were not stored", dropped));
        warn!("{}", err);
        last_error.set(Some(Fault::from(&err)));
        events.send(SessionEvent::PersistFailed {
            message: err.to_string(),
        });
    }
}

async fn persist(
    sample: &HeartRateSample,
    sink: &dyn HeartRateSink,
    events: &EventDispatcher,
    last_error: &StateCell<Option<Fault>>,
) {
    let Some(timestamp_millis) = sample.timestamp_millis() else {
        debug!("Sample without timestamp, not persisted");
        return;
    };
    match sink.insert(sample.bpm, timestamp_millis).await {
        Ok(()) => events.send(SessionEvent::Persisted {
            value: sample.bpm,
            timestamp_millis,
        }),
        Err(e) => {
            warn!("Failed to persist sample: {}", e);
            last_error.set(Some(Fault::from(&e)));
            events.send(SessionEvent::PersistFailed {
                message: e.to_string(),
            });
        }
    }
}

struct ViewTask {
    scanning: watch::Receiver<bool>,
    discovered: watch::Receiver<Vec<PeripheralHandle>>,
    scan_error: watch::Receiver<Option<Fault>>,
    active: watch::Receiver<Option<ActiveDevice>>,
    reading: watch::Receiver<bool>,
    own_error: watch::Receiver<Option<Fault>>,
    last_error: Arc<StateCell<Option<Fault>>>,
    view: Arc<StateCell<SessionView>>,
}

struct ConnectionWatch {
    peripheral: PeripheralHandle,
    state: watch::Receiver<ConnectionState>,
    services: watch::Receiver<ServiceCatalog>,
    sample: watch::Receiver<Option<HeartRateSample>>,
    error: watch::Receiver<Option<Fault>>,
}

impl ConnectionWatch {
    fn new(connection: &DeviceConnection) -> Self {
        Self {
            peripheral: connection.peripheral().clone(),
            state: connection.watch_state(),
            services: connection.watch_services(),
            sample: connection.watch_latest_sample(),
            error: connection.watch_last_error(),
        }
    }
}

// Resolves when the receiver changes; never resolves once the sender is gone.
async fn changed<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn changed_opt<T>(rx: Option<&mut watch::Receiver<T>>) {
    match rx {
        Some(rx) => changed(rx).await,
        None => std::future::pending().await,
    }
}

impl ViewTask {
    async fn run(mut self, cancel: CancellationToken) {
        let mut conn: Option<ConnectionWatch> = None;
        let mut refresh = true;
        loop {
            if refresh {
                conn = self
                    .active
                    .borrow_and_update()
                    .as_ref()
                    .map(|a| ConnectionWatch::new(&a.connection));
                refresh = false;
            }

            let snapshot = self.snapshot(conn.as_mut());
            self.view.set_if_changed(snapshot);

            let (state, services, sample, error) = match conn.as_mut() {
                Some(c) => (
                    Some(&mut c.state),
                    Some(&mut c.services),
                    Some(&mut c.sample),
                    Some(&mut c.error),
                ),
                None => (None, None, None, None),
            };
            let mut scan_failed = false;
            let mut link_failed = false;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = changed(&mut self.active) => refresh = true,
                _ = changed(&mut self.scanning) => {}
                _ = changed(&mut self.discovered) => {}
                _ = changed(&mut self.reading) => {}
                _ = changed(&mut self.own_error) => {}
                _ = changed(&mut self.scan_error) => scan_failed = true,
                _ = changed_opt(state) => {}
                _ = changed_opt(services) => {}
                _ = changed_opt(sample) => {}
                _ = changed_opt(error) => link_failed = true,
            }

            let fault = if scan_failed {
                self.scan_error.borrow().clone()
            } else if link_failed {
                conn.as_ref().and_then(|c| c.error.borrow().clone())
            } else {
                None
            };
            if let Some(fault) = fault {
                self.last_error.set(Some(fault));
            }
        }
    }

    fn snapshot(&mut self, conn: Option<&mut ConnectionWatch>) -> SessionView {
        let is_reading = *self.reading.borrow_and_update();
        let found_devices = self
            .discovered
            .borrow_and_update()
            .iter()
            .filter(|p| p.name.is_some())
            .cloned()
            .collect();

        let mut view = SessionView {
            is_scanning: *self.scanning.borrow_and_update(),
            found_devices,
            is_reading,
            last_error: self.own_error.borrow_and_update().clone(),
            ..SessionView::default()
        };

        if let Some(conn) = conn {
            view.active_device = Some(conn.peripheral.clone());
            view.connection_state = *conn.state.borrow_and_update();
            view.services = conn.services.borrow_and_update().to_display_map();
            let sample = conn.sample.borrow_and_update().clone();
            view.heart_rate = if is_reading { sample } else { None };
        }
        view
    }
}
