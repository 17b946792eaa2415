//! Peripheral discovery.
//!
//! The [`Scanner`] filters advertisements to one service (the Heart Rate
//! service by default) and keeps an insertion-ordered, deduplicated list of
//! the peripherals it has seen, plus a scanning flag. Both are observable
//! [`StateCell`]s written only by the scanner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_types::{PeripheralHandle, uuids};

use crate::error::{Error, Fault, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::state::StateCell;
use crate::transport::{ScanEvent, ScanEvents, Transport};

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Service UUID advertisements must carry.
    pub service: Uuid,
    /// Forget previously discovered peripherals when a scan starts.
    pub clear_on_start: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            service: uuids::HEART_RATE_SERVICE,
            clear_on_start: false,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service to filter on.
    #[must_use]
    pub fn service(mut self, service: Uuid) -> Self {
        self.service = service;
        self
    }

    /// Set whether a new scan clears the discovered list.
    #[must_use]
    pub fn clear_on_start(mut self, clear: bool) -> Self {
        self.clear_on_start = clear;
        self
    }
}

struct ScanState {
    scanning: StateCell<bool>,
    discovered: StateCell<Vec<PeripheralHandle>>,
    last_error: StateCell<Option<Fault>>,
    // Bumped on every start/stop; a scan task only writes while it holds the
    // generation it was started with.
    generation: Mutex<u64>,
    // The running scan task and the generation it was started with.
    task: Mutex<Option<(u64, CancellationToken)>>,
}

impl ScanState {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Discovers peripherals advertising a service.
///
/// Cloning a `Scanner` yields another handle to the same scan.
#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
    options: ScanOptions,
    events: EventDispatcher,
    state: Arc<ScanState>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("options", &self.options)
            .field("scanning", &self.is_scanning())
            .field("discovered", &self.state.discovered.borrow().len())
            .finish()
    }
}

impl Scanner {
    /// Create a scanner over `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ScanOptions,
        events: EventDispatcher,
    ) -> Self {
        Self {
            transport,
            options,
            events,
            state: Arc::new(ScanState {
                scanning: StateCell::new(false),
                discovered: StateCell::default(),
                last_error: StateCell::default(),
                generation: Mutex::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// The options this scanner was built with.
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Start scanning.
    ///
    /// Starting while already scanning restarts the scan with the same
    /// filter; the discovered list is kept unless
    /// [`ScanOptions::clear_on_start`] is set.
    ///
    /// # Errors
    ///
    /// [`Error::ScanFailure`] (or the transport's error) when the radio
    /// refuses to scan. The scanning flag is cleared and the failure is
    /// published through [`Scanner::last_error`] as well.
    #[tracing::instrument(level = "info", skip(self), fields(service = %self.options.service))]
    pub async fn start_scanning(&self) -> Result<()> {
        let previous = self.state.task().take();
        if let Some((_, previous)) = previous {
            debug!("Restarting active scan");
            previous.cancel();
            *self.state.generation() += 1;
            if let Err(e) = self.transport.stop_scan().await {
                debug!("Stopping previous scan failed: {}", e);
            }
        }

        if self.options.clear_on_start {
            self.clear_discovered();
        }

        let stream = match self.transport.start_scan(self.options.service).await {
            Ok(stream) => stream,
            Err(e) => {
                let generation = *self.state.generation();
                self.fail(generation, &e);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let generation = {
            let mut generation = self.state.generation();
            *generation += 1;
            self.state.scanning.set_if_changed(true);
            *generation
        };
        *self.state.task() = Some((generation, token.clone()));
        self.state.last_error.set_if_changed(None);
        self.events.send(SessionEvent::ScanStarted);
        info!("Scanning for peripherals");

        tokio::spawn(self.clone().run(stream, token, generation));
        Ok(())
    }

    /// Stop scanning. Stopping while not scanning is a no-op.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn stop_scanning(&self) -> Result<()> {
        let Some((_, token)) = self.state.task().take() else {
            debug!("Not scanning");
            return Ok(());
        };
        token.cancel();
        {
            let mut generation = self.state.generation();
            *generation += 1;
            self.state.scanning.set_if_changed(false);
        }
        self.events.send(SessionEvent::ScanStopped);
        info!("Scan stopped");
        self.transport.stop_scan().await
    }

    async fn run(self, mut stream: ScanEvents, token: CancellationToken, generation: u64) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                event = stream.next() => event,
            };

            match event {
                Some(ScanEvent::Advertisement { peripheral, rssi }) => {
                    self.record(generation, peripheral, rssi);
                }
                Some(ScanEvent::Failed(message)) => {
                    self.abort(generation, Error::ScanFailure(message)).await;
                    return;
                }
                None => {
                    let err = Error::ScanFailure("scan event stream ended".to_string());
                    self.abort(generation, err).await;
                    return;
                }
            }
        }
    }

    fn record(&self, generation: u64, peripheral: PeripheralHandle, rssi: Option<i16>) {
        let current = self.state.generation();
        if *current != generation {
            return;
        }
        let added = self.state.discovered.update(|list| {
            if list.contains(&peripheral) {
                false
            } else {
                list.push(peripheral.clone());
                true
            }
        });
        drop(current);

        if added {
            info!("Discovered {}", peripheral);
            self.events.send(SessionEvent::Discovered { peripheral, rssi });
        }
    }

    async fn abort(&self, generation: u64, err: Error) {
        if !self.fail(generation, &err) {
            return;
        }
        {
            let mut task = self.state.task();
            if task.as_ref().is_some_and(|(started, _)| *started == generation) {
                task.take();
            }
        }
        if let Err(e) = self.transport.stop_scan().await {
            debug!("Stopping failed scan: {}", e);
        }
    }

    // Publish a scan failure if `generation` is still current.
    fn fail(&self, generation: u64, err: &Error) -> bool {
        let mut current = self.state.generation();
        if *current != generation {
            return false;
        }
        *current += 1;
        self.state.scanning.set_if_changed(false);
        self.state.last_error.set(Some(Fault::from(err)));
        drop(current);

        warn!("Scan failed: {}", err);
        self.events.send(SessionEvent::ScanFailed {
            message: err.to_string(),
        });
        true
    }

    /// Whether a scan is active.
    pub fn is_scanning(&self) -> bool {
        *self.state.scanning.borrow()
    }

    /// Observe the scanning flag.
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.state.scanning.subscribe()
    }

    /// Peripherals seen so far, in discovery order.
    pub fn discovered(&self) -> Vec<PeripheralHandle> {
        self.state.discovered.get()
    }

    /// Observe the discovered list.
    pub fn watch_discovered(&self) -> watch::Receiver<Vec<PeripheralHandle>> {
        self.state.discovered.subscribe()
    }

    /// Forget every discovered peripheral.
    pub fn clear_discovered(&self) {
        self.state.discovered.update(|list| {
            let changed = !list.is_empty();
            list.clear();
            changed
        });
    }

    /// The last scan failure, cleared when a scan starts successfully.
    pub fn last_error(&self) -> Option<Fault> {
        self.state.last_error.get()
    }

    /// Observe scan failures.
    pub fn watch_last_error(&self) -> watch::Receiver<Option<Fault>> {
        self.state.last_error.subscribe()
    }

    /// Scan for `duration`, then stop and return what was found.
    pub async fn scan_for(&self, duration: Duration) -> Result<Vec<PeripheralHandle>> {
        self.start_scanning().await?;
        sleep(duration).await;
        if !self.is_scanning()
            && let Some(fault) = self.last_error()
        {
            return Err(Error::ScanFailure(fault.message));
        }
        self.stop_scanning().await?;
        Ok(self.discovered())
    }

    /// Scan until a peripheral matching `query` (identifier or name) shows
    /// up, or `wait` elapses. Leaves scanning stopped either way.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when nothing matched in time; scan failures as for
    /// [`Scanner::start_scanning`].
    pub async fn find(&self, query: &str, wait: Duration) -> Result<PeripheralHandle> {
        let mut discovered = self.watch_discovered();
        let mut scanning = self.watch_scanning();
        self.start_scanning().await?;

        let found = timeout(wait, async {
            loop {
                if let Some(p) = discovered.borrow_and_update().iter().find(|p| p.matches(query)) {
                    return Ok(p.clone());
                }
                tokio::select! {
                    changed = discovered.changed() => {
                        if changed.is_err() {
                            return Err(Error::Cancelled);
                        }
                    }
                    _ = async { let _ = scanning.wait_for(|s| !*s).await; } => {
                        let message = self
                            .last_error()
                            .map(|f| f.message)
                            .unwrap_or_else(|| "scan stopped".to_string());
                        return Err(Error::ScanFailure(message));
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::timeout(format!("find peripheral '{}'", query), wait))
        .and_then(|r| r);

        self.stop_scanning().await?;
        found
    }
}
