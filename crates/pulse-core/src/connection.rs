//! One peripheral's GATT session.
//!
//! A [`DeviceConnection`] owns a background task that is the only writer of
//! the connection's observable state. Commands, transport outcomes and link
//! events all arrive through one inbox, so they are applied in order.
//!
//! Every `connect()` and `disconnect()` starts a new session. Anything a
//! transport callback sends back is tagged with the session that produced
//! it, and the task drops messages whose session is no longer current. A
//! late "connected" from a torn-down session therefore cannot resurrect it.
//!
//! ```text
//! Disconnected --connect--> Connecting --link up--> Connected
//! Connected --discover--> Discovering --catalog--> Connected
//! Connected --subscribe--> Subscribed --unsubscribe--> Connected
//! any --disconnect--> Disconnected
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_types::{
    ConnectionState, HeartRateSample, PeripheralHandle, ServiceCatalog, codec, uuids,
};

use crate::error::{Error, Fault, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::state::StateCell;
use crate::transport::{Link, LinkEvent, LinkEvents, Transport};

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for notification and descriptor writes.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-connection sample broadcast.
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Called by the connection task with every decoded sample, in arrival
/// order, before the sample is published anywhere else.
pub type SampleTap = Box<dyn Fn(&HeartRateSample) + Send + Sync>;

/// Timeouts for transport requests.
///
/// A connect that has not produced a link-up event within
/// `connection_timeout` is abandoned and the state returns to
/// `Disconnected`; a discovery that has not completed within
/// `discovery_timeout` returns the state to `Connected`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pulse_core::connection::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .discovery_timeout(Duration::from_secs(15));
/// assert_eq!(config.write_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for service discovery.
    pub discovery_timeout: Duration,
    /// Timeout for notification and descriptor writes.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    DiscoverServices,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Connect,
    Discover,
    Subscribe,
    Unsubscribe,
}

enum Inbox {
    Command(Command),
    Opened {
        session: u64,
        link: Arc<dyn Link>,
        events: LinkEvents,
    },
    Link {
        session: u64,
        event: LinkEvent,
    },
    Outcome {
        session: u64,
        op: Op,
        result: Result<()>,
    },
    Deadline {
        session: u64,
        id: u64,
    },
}

struct Shared {
    state: StateCell<ConnectionState>,
    services: StateCell<ServiceCatalog>,
    latest_sample: StateCell<Option<HeartRateSample>>,
    last_error: StateCell<Option<Fault>>,
    samples: broadcast::Sender<HeartRateSample>,
}

/// A GATT session with one peripheral.
///
/// Commands return as soon as they are queued; their outcomes show up in the
/// observable state. Dropping the connection stops its task and releases the
/// link.
pub struct DeviceConnection {
    peripheral: PeripheralHandle,
    inbox: mpsc::UnboundedSender<Inbox>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("peripheral", &self.peripheral)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    /// Create a connection to `peripheral` and start its task.
    ///
    /// Nothing is sent to the transport until [`DeviceConnection::connect`].
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
        config: ConnectionConfig,
        events: EventDispatcher,
    ) -> Self {
        Self::spawn(transport, peripheral, config, events, None)
    }

    /// Like [`DeviceConnection::new`], with `tap` invoked synchronously for
    /// each decoded sample.
    pub fn with_sample_tap(
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
        config: ConnectionConfig,
        events: EventDispatcher,
        tap: SampleTap,
    ) -> Self {
        Self::spawn(transport, peripheral, config, events, Some(tap))
    }

    fn spawn(
        transport: Arc<dyn Transport>,
        peripheral: PeripheralHandle,
        config: ConnectionConfig,
        events: EventDispatcher,
        tap: Option<SampleTap>,
    ) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: StateCell::default(),
            services: StateCell::default(),
            latest_sample: StateCell::default(),
            last_error: StateCell::default(),
            samples,
        });
        let cancel = CancellationToken::new();

        let actor = Actor {
            transport,
            peripheral: peripheral.clone(),
            config,
            events,
            shared: Arc::clone(&shared),
            inbox: inbox.clone(),
            session: 0,
            link: None,
            tasks: Vec::new(),
            deadline: None,
            next_deadline: 0,
            toggling: false,
            queued_toggle: None,
            tap,
        };
        tokio::spawn(actor.run(rx, cancel.clone()));

        Self {
            peripheral,
            inbox,
            shared,
            cancel,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox
            .send(Inbox::Command(command))
            .map_err(|_| Error::Cancelled)
    }

    /// The peripheral this connection targets. Never changes.
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    /// Request a connection. Ignored unless disconnected.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Release the link unconditionally. Idempotent, and safe mid-connect
    /// or mid-discovery.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Refresh the service catalog. Valid while connected.
    pub fn discover_services(&self) -> Result<()> {
        self.send(Command::DiscoverServices)
    }

    /// Enable Heart Rate Measurement notifications.
    ///
    /// When the catalog lacks the characteristic nothing is sent and a
    /// [`Error::CharacteristicNotFound`] is published via
    /// [`DeviceConnection::last_error`].
    pub fn subscribe_heart_rate(&self) -> Result<()> {
        self.send(Command::Subscribe)
    }

    /// Disable Heart Rate Measurement notifications.
    pub fn unsubscribe_heart_rate(&self) -> Result<()> {
        self.send(Command::Unsubscribe)
    }

    /// Stop the task and release the link.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Current service catalog.
    pub fn services(&self) -> ServiceCatalog {
        self.shared.services.get()
    }

    /// Observe the service catalog.
    pub fn watch_services(&self) -> watch::Receiver<ServiceCatalog> {
        self.shared.services.subscribe()
    }

    /// Most recent successfully decoded sample.
    pub fn latest_sample(&self) -> Option<HeartRateSample> {
        self.shared.latest_sample.get()
    }

    /// Observe the latest sample.
    pub fn watch_latest_sample(&self) -> watch::Receiver<Option<HeartRateSample>> {
        self.shared.latest_sample.subscribe()
    }

    /// Most recent failure; cleared by the next `connect()`.
    pub fn last_error(&self) -> Option<Fault> {
        self.shared.last_error.get()
    }

    /// Observe failures.
    pub fn watch_last_error(&self) -> watch::Receiver<Option<Fault>> {
        self.shared.last_error.subscribe()
    }

    /// Receive every decoded sample exactly once, from now on.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<HeartRateSample> {
        self.shared.samples.subscribe()
    }

    /// Wait until the state satisfies `predicate`, or `wait` elapses.
    pub async fn wait_for_state<F>(&self, wait: Duration, predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.watch_state();
        match timeout(wait, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::timeout("wait for connection state", wait)),
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor {
    transport: Arc<dyn Transport>,
    peripheral: PeripheralHandle,
    config: ConnectionConfig,
    events: EventDispatcher,
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedSender<Inbox>,
    session: u64,
    link: Option<Arc<dyn Link>>,
    // Forwarder, in-flight requests and timers of the current session.
    tasks: Vec<JoinHandle<()>>,
    deadline: Option<u64>,
    next_deadline: u64,
    // A notification toggle in flight, and the opposite one requested meanwhile.
    toggling: bool,
    queued_toggle: Option<Command>,
    tap: Option<SampleTap>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Inbox>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };
            self.handle(msg);
        }

        self.abort_tasks();
        self.tap = None;
        if let Some(link) = self.link.take() {
            debug!(peripheral = %self.peripheral, "Connection dropped, closing link");
            match timeout(self.config.write_timeout, link.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Closing link failed: {}", e),
                Err(_) => debug!("Closing link timed out"),
            }
        }
        self.shared.state.set_if_changed(ConnectionState::Disconnected);
    }

    fn handle(&mut self, msg: Inbox) {
        match msg {
            Inbox::Command(command) => self.on_command(command),
            Inbox::Opened {
                session,
                link,
                events,
            } => {
                if session != self.session {
                    debug!(session, "Dropping link opened by a stale session");
                    tokio::spawn(async move {
                        let _ = link.close().await;
                    });
                    return;
                }
                self.on_opened(link, events);
            }
            Inbox::Link { session, event } => {
                if session != self.session {
                    debug!(session, current = self.session, "Ignoring stale link event");
                    return;
                }
                self.on_link_event(event);
            }
            Inbox::Outcome {
                session,
                op,
                result,
            } => {
                if session != self.session {
                    debug!(session, ?op, "Ignoring stale outcome");
                    return;
                }
                self.on_outcome(op, result);
            }
            Inbox::Deadline { session, id } => {
                if session != self.session || self.deadline != Some(id) {
                    return;
                }
                self.deadline = None;
                self.on_deadline();
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.shared.state.set_if_changed(state) {
            debug!(peripheral = %self.peripheral, %state, "Connection state changed");
            self.events.send(SessionEvent::StateChanged {
                peripheral: self.peripheral.clone(),
                state,
            });
        }
    }

    fn report(&self, err: Error) {
        warn!(peripheral = %self.peripheral, "{}", err);
        self.shared.last_error.set(Some(Fault::from(&err)));
        self.events
            .send(SessionEvent::error(Some(&self.peripheral), &err));
    }

    fn replace_services(&self, catalog: ServiceCatalog) {
        let service_count = catalog.service_count();
        self.shared.services.set(catalog);
        self.events.send(SessionEvent::ServicesDiscovered {
            peripheral: self.peripheral.clone(),
            service_count,
        });
    }

    fn spawn_op<F>(&mut self, op: Op, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let session = self.session;
        self.tasks.push(tokio::spawn(async move {
            let result = fut.await;
            let _ = inbox.send(Inbox::Outcome {
                session,
                op,
                result,
            });
        }));
    }

    fn arm_deadline(&mut self, after: Duration) {
        self.next_deadline += 1;
        let id = self.next_deadline;
        self.deadline = Some(id);
        let inbox = self.inbox.clone();
        let session = self.session;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Inbox::Deadline { session, id });
        }));
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.deadline = None;
        self.toggling = false;
        self.queued_toggle = None;
    }

    // End the current session: stale anything in flight, release the link.
    fn teardown(&mut self) {
        self.session += 1;
        self.abort_tasks();
        if let Some(link) = self.link.take() {
            let close_timeout = self.config.write_timeout;
            tokio::spawn(async move {
                match timeout(close_timeout, link.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Closing link failed: {}", e),
                    Err(_) => debug!("Closing link timed out"),
                }
            });
        }
        self.shared.services.set_if_changed(ServiceCatalog::default());
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_command(&mut self, command: Command) {
        let state = self.state();
        match command {
            Command::Connect => {
                if state != ConnectionState::Disconnected {
                    debug!(%state, "Connect ignored");
                    return;
                }
                self.session += 1;
                self.shared.last_error.set_if_changed(None);
                self.set_state(ConnectionState::Connecting);
                info!(peripheral = %self.peripheral, "Connecting");

                self.arm_deadline(self.config.connection_timeout);
                let transport = Arc::clone(&self.transport);
                let peripheral = self.peripheral.clone();
                let inbox = self.inbox.clone();
                let session = self.session;
                self.tasks.push(tokio::spawn(async move {
                    let opened = async {
                        let link = transport.open(&peripheral).await?;
                        let events = link.events().await?;
                        Ok::<_, Error>((link, events))
                    }
                    .await;
                    let msg = match opened {
                        Ok((link, events)) => Inbox::Opened {
                            session,
                            link,
                            events,
                        },
                        Err(e) => Inbox::Outcome {
                            session,
                            op: Op::Connect,
                            result: Err(e),
                        },
                    };
                    let _ = inbox.send(msg);
                }));
            }
            Command::Disconnect => {
                if state == ConnectionState::Disconnected && self.link.is_none() {
                    debug!("Disconnect ignored, already disconnected");
                    return;
                }
                info!(peripheral = %self.peripheral, "Disconnecting");
                self.teardown();
            }
            Command::DiscoverServices => {
                if state != ConnectionState::Connected {
                    self.report(Error::InvalidState {
                        operation: "discover services",
                        state,
                    });
                    return;
                }
                let Some(link) = self.link.clone() else {
                    self.report(Error::NotConnected);
                    return;
                };
                self.set_state(ConnectionState::Discovering);
                self.arm_deadline(self.config.discovery_timeout);
                self.spawn_op(Op::Discover, async move { link.discover_services().await });
            }
            Command::Subscribe | Command::Unsubscribe if self.toggling => {
                debug!(?command, "Notification toggle in flight, queued");
                self.queued_toggle = Some(command);
            }
            Command::Subscribe => {
                self.queued_toggle = None;
                if state == ConnectionState::Subscribed {
                    debug!("Already subscribed");
                    return;
                }
                if state != ConnectionState::Connected {
                    self.report(Error::InvalidState {
                        operation: "subscribe",
                        state,
                    });
                    return;
                }
                let catalog = self.shared.services.borrow().clone();
                let has_measurement = catalog.contains_characteristic(
                    &uuids::HEART_RATE_SERVICE,
                    &uuids::HEART_RATE_MEASUREMENT,
                );
                if !has_measurement {
                    self.report(Error::characteristic_not_found(
                        uuids::HEART_RATE_MEASUREMENT.to_string(),
                        catalog.service_count(),
                    ));
                    return;
                }
                let Some(link) = self.link.clone() else {
                    self.report(Error::NotConnected);
                    return;
                };
                let write_timeout = self.config.write_timeout;
                self.toggling = true;
                self.spawn_op(Op::Subscribe, async move {
                    with_timeout(
                        "enable notifications",
                        write_timeout,
                        link.set_notify(uuids::HEART_RATE_MEASUREMENT, true),
                    )
                    .await?;
                    with_timeout(
                        "write notification descriptor",
                        write_timeout,
                        link.write_descriptor(
                            uuids::HEART_RATE_MEASUREMENT,
                            uuids::CLIENT_CHARACTERISTIC_CONFIG,
                            &uuids::ENABLE_NOTIFICATION_VALUE,
                        ),
                    )
                    .await
                });
            }
            Command::Unsubscribe => {
                self.queued_toggle = None;
                if state != ConnectionState::Subscribed {
                    debug!(%state, "Unsubscribe ignored, not subscribed");
                    return;
                }
                let Some(link) = self.link.clone() else {
                    self.report(Error::NotConnected);
                    return;
                };
                let write_timeout = self.config.write_timeout;
                self.toggling = true;
                self.spawn_op(Op::Unsubscribe, async move {
                    with_timeout(
                        "write notification descriptor",
                        write_timeout,
                        link.write_descriptor(
                            uuids::HEART_RATE_MEASUREMENT,
                            uuids::CLIENT_CHARACTERISTIC_CONFIG,
                            &uuids::DISABLE_NOTIFICATION_VALUE,
                        ),
                    )
                    .await?;
                    with_timeout(
                        "disable notifications",
                        write_timeout,
                        link.set_notify(uuids::HEART_RATE_MEASUREMENT, false),
                    )
                    .await
                });
            }
        }
    }

    fn on_opened(&mut self, link: Arc<dyn Link>, mut events: LinkEvents) {
        let inbox = self.inbox.clone();
        let session = self.session;
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if inbox.send(Inbox::Link { session, event }).is_err() {
                    return;
                }
            }
        }));

        self.link = Some(Arc::clone(&link));
        self.spawn_op(Op::Connect, async move { link.connect().await });
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(catalog) => {
                if self.state() == ConnectionState::Connecting {
                    self.deadline = None;
                    info!(peripheral = %self.peripheral, "Connected");
                    self.set_state(ConnectionState::Connected);
                }
                self.replace_services(catalog);
            }
            LinkEvent::ServicesDiscovered(catalog) => {
                debug!(services = catalog.service_count(), "Services discovered");
                self.replace_services(catalog);
                if self.state() == ConnectionState::Discovering {
                    self.deadline = None;
                    self.set_state(ConnectionState::Connected);
                }
            }
            LinkEvent::ValueChanged {
                characteristic,
                value,
            } => {
                if characteristic != uuids::HEART_RATE_MEASUREMENT {
                    debug!(%characteristic, "Ignoring notification");
                    return;
                }
                self.on_measurement(&value);
            }
            LinkEvent::Disconnected => {
                if self.state() == ConnectionState::Disconnected {
                    return;
                }
                self.report(Error::connection_lost(&self.peripheral.id));
                self.teardown();
            }
        }
    }

    fn on_measurement(&self, payload: &[u8]) {
        match codec::decode(payload) {
            Ok(sample) => {
                let sample = sample.with_timestamp(OffsetDateTime::now_utc());
                debug!(bpm = sample.bpm, rr = sample.rr_intervals.len(), "Heart rate");
                if let Some(tap) = &self.tap {
                    tap(&sample);
                }
                let _ = self.shared.samples.send(sample.clone());
                self.shared.latest_sample.set(Some(sample.clone()));
                self.events.send(SessionEvent::Sample {
                    peripheral: self.peripheral.clone(),
                    sample,
                });
            }
            Err(e) => {
                warn!(peripheral = %self.peripheral, "Dropping measurement: {}", e);
                self.events.send(SessionEvent::DecodeFailed {
                    peripheral: self.peripheral.clone(),
                    error: e.to_string(),
                });
                self.shared
                    .last_error
                    .set(Some(Fault::from(&Error::Decode(e))));
            }
        }
    }

    fn on_outcome(&mut self, op: Op, result: Result<()>) {
        match (op, result) {
            (Op::Connect, Ok(())) => {}
            (Op::Connect, Err(e)) => {
                self.report(e);
                self.teardown();
            }
            (Op::Discover, Ok(())) => {}
            (Op::Discover, Err(e)) => {
                self.report(e);
                if self.state() == ConnectionState::Discovering {
                    self.deadline = None;
                    self.set_state(ConnectionState::Connected);
                }
            }
            (Op::Subscribe, Ok(())) => {
                if self.state() == ConnectionState::Connected {
                    info!(peripheral = %self.peripheral, "Heart rate notifications enabled");
                    self.set_state(ConnectionState::Subscribed);
                }
            }
            (Op::Unsubscribe, Ok(())) => {
                if self.state() == ConnectionState::Subscribed {
                    info!(peripheral = %self.peripheral, "Heart rate notifications disabled");
                    self.set_state(ConnectionState::Connected);
                }
            }
            (Op::Subscribe | Op::Unsubscribe, Err(e)) => self.report(e),
        }

        if matches!(op, Op::Subscribe | Op::Unsubscribe) {
            self.toggling = false;
            if let Some(command) = self.queued_toggle.take() {
                self.on_command(command);
            }
        }
    }

    fn on_deadline(&mut self) {
        match self.state() {
            ConnectionState::Connecting => {
                self.report(Error::timeout("connect", self.config.connection_timeout));
                self.teardown();
            }
            ConnectionState::Discovering => {
                self.report(Error::timeout(
                    "discover services",
                    self.config.discovery_timeout,
                ));
                self.set_state(ConnectionState::Connected);
            }
            _ => {}
        }
    }
}

async fn with_timeout<F>(operation: &str, duration: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    timeout(duration, fut)
        .await
        .map_err(|_| Error::timeout(operation, duration))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{LinkCall, MockTransport};

    const WAIT: Duration = Duration::from_secs(1);

    fn connection(transport: &Arc<MockTransport>) -> DeviceConnection {
        DeviceConnection::new(
            transport.clone(),
            PeripheralHandle::named("AA:BB:CC:DD:EE:FF", "Polar H10"),
            ConnectionConfig::default(),
            EventDispatcher::default(),
        )
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new();
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert_eq!(config.discovery_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(10));

        let config = config.write_timeout(Duration::from_secs(3));
        assert_eq!(config.write_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_connect_publishes_cached_services() {
        let transport = Arc::new(MockTransport::new());
        let conn = connection(&transport);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        let services = conn.services();
        assert!(
            services.contains_characteristic(
                &uuids::HEART_RATE_SERVICE,
                &uuids::HEART_RATE_MEASUREMENT
            )
        );
    }

    #[tokio::test]
    async fn test_subscribe_writes_enable_descriptor() {
        let transport = Arc::new(MockTransport::new());
        let conn = connection(&transport);
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        conn.subscribe_heart_rate().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Subscribed)
            .await
            .unwrap();

        let link = transport.last_link().unwrap();
        assert!(link.is_notifying());
        assert_eq!(
            link.call_count(&LinkCall::WriteDescriptor {
                characteristic: uuids::HEART_RATE_MEASUREMENT,
                descriptor: uuids::CLIENT_CHARACTERISTIC_CONFIG,
                value: uuids::ENABLE_NOTIFICATION_VALUE.to_vec(),
            }),
            1
        );
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_reports_invalid_state() {
        let transport = Arc::new(MockTransport::new());
        let conn = connection(&transport);
        conn.subscribe_heart_rate().unwrap();

        let mut errors = conn.watch_last_error();
        let fault = timeout(WAIT, errors.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(fault.kind, ErrorKind::InvalidState);
        assert!(transport.links().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_returns_to_disconnected() {
        let transport = Arc::new(MockTransport::new().manual_connect());
        let conn = DeviceConnection::new(
            transport.clone(),
            PeripheralHandle::named("AA", "Strap"),
            ConnectionConfig::default().connection_timeout(Duration::from_secs(2)),
            EventDispatcher::default(),
        );
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        conn.wait_for_state(Duration::from_secs(5), |s| {
            *s == ConnectionState::Disconnected
        })
        .await
        .unwrap();
        let fault = conn.last_error().unwrap();
        assert_eq!(fault.kind, ErrorKind::Timeout);
    }

    async fn wait_fault(conn: &DeviceConnection) -> Fault {
        let mut errors = conn.watch_last_error();
        timeout(WAIT, errors.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap()
    }

    async fn connected(
        transport: &Arc<MockTransport>,
        config: ConnectionConfig,
    ) -> DeviceConnection {
        let conn = DeviceConnection::new(
            transport.clone(),
            PeripheralHandle::named("AA", "Strap"),
            config,
            EventDispatcher::default(),
        );
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_returns_to_connected() {
        let transport = Arc::new(MockTransport::new().manual_discovery());
        let conn = connected(
            &transport,
            ConnectionConfig::default().discovery_timeout(Duration::from_secs(2)),
        )
        .await;

        conn.discover_services().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Discovering)
            .await
            .unwrap();

        conn.wait_for_state(Duration::from_secs(5), |s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        let fault = conn.last_error().unwrap();
        assert_eq!(fault.kind, ErrorKind::Timeout);
        assert!(fault.message.contains("discover services"));
        // The catalog from connect is kept.
        assert!(conn.services().contains_characteristic(
            &uuids::HEART_RATE_SERVICE,
            &uuids::HEART_RATE_MEASUREMENT
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reports_and_disconnects() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fail_connect(true);
        let conn = connection(&transport);

        conn.connect().unwrap();
        let fault = wait_fault(&conn).await;
        assert_eq!(fault.kind, ErrorKind::ConnectionLost);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let link = transport.last_link().unwrap();
        assert_eq!(link.call_count(&LinkCall::Connect), 1);
        timeout(WAIT, async {
            while !link.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // A later attempt starts from a clean slate.
        transport.set_fail_connect(false);
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert!(conn.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_write_failure_stays_connected() {
        let transport = Arc::new(MockTransport::new());
        let conn = connected(&transport, ConnectionConfig::default()).await;
        let link = transport.last_link().unwrap();
        link.set_fail_writes(true);

        conn.subscribe_heart_rate().unwrap();
        let fault = wait_fault(&conn).await;
        assert_eq!(fault.kind, ErrorKind::Bluetooth);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(!link.is_notifying());

        // Nothing stays queued behind the failed toggle.
        link.set_fail_writes(false);
        conn.subscribe_heart_rate().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Subscribed)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_subscribe_is_applied_afterwards() {
        let transport = Arc::new(MockTransport::new());
        let events = EventDispatcher::default();
        let conn = DeviceConnection::new(
            transport.clone(),
            PeripheralHandle::named("AA", "Strap"),
            ConnectionConfig::default(),
            events.clone(),
        );
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let mut rx = events.subscribe();
        conn.subscribe_heart_rate().unwrap();
        conn.unsubscribe_heart_rate().unwrap();

        let states = timeout(WAIT, async {
            let mut states = Vec::new();
            while states.last() != Some(&ConnectionState::Connected) {
                if let Ok(SessionEvent::StateChanged { state, .. }) = rx.recv().await {
                    states.push(state);
                }
            }
            states
        })
        .await
        .unwrap();
        assert_eq!(
            states,
            vec![ConnectionState::Subscribed, ConnectionState::Connected]
        );

        let link = transport.last_link().unwrap();
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

    #[tokio::test(start_paused = true)]
    async fn test_latest_queued_toggle_wins() {
        let transport = Arc::new(MockTransport::new());
        let conn = connected(&transport, ConnectionConfig::default()).await;

        conn.subscribe_heart_rate().unwrap();
        conn.unsubscribe_heart_rate().unwrap();
        conn.subscribe_heart_rate().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Subscribed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(conn.state(), ConnectionState::Subscribed);
        let link = transport.last_link().unwrap();
        assert!(link.is_notifying());
        let enable = LinkCall::WriteDescriptor {
            characteristic: uuids::HEART_RATE_MEASUREMENT,
            descriptor: uuids::CLIENT_CHARACTERISTIC_CONFIG,
            value: uuids::ENABLE_NOTIFICATION_VALUE.to_vec(),
        };
        assert_eq!(link.call_count(&enable), 1);
    }

    #[tokio::test]
    async fn test_sample_tap_sees_samples_before_latest_sample() {
        let transport = Arc::new(MockTransport::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tapped = Arc::clone(&seen);
        let conn = DeviceConnection::with_sample_tap(
            transport.clone(),
            PeripheralHandle::named("AA", "Strap"),
            ConnectionConfig::default(),
            EventDispatcher::default(),
            Box::new(move |sample: &HeartRateSample| {
                tapped.lock().unwrap().push(sample.bpm);
            }),
        );
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let link = transport.last_link().unwrap();
        link.notify(vec![0x00, 0x48]);
        link.notify(vec![0x00, 0x49]);
        let mut latest = conn.watch_latest_sample();
        timeout(WAIT, latest.wait_for(|s| s.as_ref().is_some_and(|s| s.bpm == 0x49)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0x48, 0x49]);
    }

    #[tokio::test]
    async fn test_drop_closes_link() {
        let transport = Arc::new(MockTransport::new());
        let conn = connection(&transport);
        conn.connect().unwrap();
        conn.wait_for_state(WAIT, |s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        let link = transport.last_link().unwrap();

        drop(conn);
        timeout(WAIT, async {
            while !link.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
