//! The radio boundary.
//!
//! [`Transport`] and [`Link`] are the only way the rest of the crate talks to
//! a Bluetooth stack. Outcomes of connect, discovery and notification requests
//! arrive asynchronously on the link's event stream, never as return values
//! of the request itself. [`BtleTransport`] implements the boundary over
//! `btleplug`; [`crate::mock::MockTransport`] implements it in memory.

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_types::{PeripheralHandle, ServiceCatalog};

use crate::error::{Error, Result};

/// An advertisement-level event from an active scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A peripheral advertising the scanned service was seen.
    Advertisement {
        /// The advertising peripheral.
        peripheral: PeripheralHandle,
        /// Received signal strength in dBm.
        rssi: Option<i16>,
    },
    /// The radio aborted the scan.
    Failed(String),
}

/// An event on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link came up; carries whatever services the stack already knows.
    Connected(ServiceCatalog),
    /// Service discovery finished.
    ServicesDiscovered(ServiceCatalog),
    /// A notification arrived on a characteristic.
    ValueChanged {
        /// The notifying characteristic.
        characteristic: Uuid,
        /// Raw attribute value.
        value: Vec<u8>,
    },
    /// The link dropped.
    Disconnected,
}

/// Stream of scan events.
pub type ScanEvents = BoxStream<'static, ScanEvent>;

/// Stream of link events.
pub type LinkEvents = BoxStream<'static, LinkEvent>;

/// A Bluetooth stack able to scan and open links.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning for peripherals advertising `service`.
    ///
    /// Only one scan is active at a time; starting again replaces the
    /// previous scan's stream.
    async fn start_scan(&self, service: Uuid) -> Result<ScanEvents>;

    /// Stop the active scan. Stopping with no active scan is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral without connecting it.
    async fn open(&self, peripheral: &PeripheralHandle) -> Result<Arc<dyn Link>>;
}

/// One peripheral's GATT session.
#[async_trait]
pub trait Link: Send + Sync {
    /// The peripheral this link talks to.
    fn peripheral(&self) -> &PeripheralHandle;

    /// Events for this link. Call once, before [`Link::connect`].
    async fn events(&self) -> Result<LinkEvents>;

    /// Request a connection; success is reported as [`LinkEvent::Connected`].
    async fn connect(&self) -> Result<()>;

    /// Request service discovery; reported as [`LinkEvent::ServicesDiscovered`].
    async fn discover_services(&self) -> Result<()>;

    /// Enable or disable change notification on a characteristic.
    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Write a descriptor of a characteristic.
    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Release the session. Safe to call on a link that never connected.
    async fn close(&self) -> Result<()>;
}

/// Get the first available Bluetooth adapter.
///
/// Any failure here means there is no usable radio, so it is reported as
/// [`Error::TransportUnavailable`].
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::TransportUnavailable("no Bluetooth adapter found".to_string()))
}

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs; elsewhere they wrap the address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// The identifier used for a peripheral: its address, or the platform ID
/// where the address is hidden (macOS reports all zeros).
pub fn peripheral_identifier(address: &str, id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(id)
    } else {
        address.to_string()
    }
}

fn catalog_of(peripheral: &Peripheral) -> ServiceCatalog {
    peripheral
        .services()
        .into_iter()
        .map(|service| {
            let characteristics: Vec<Uuid> =
                service.characteristics.iter().map(|c| c.uuid).collect();
            (service.uuid, characteristics)
        })
        .collect()
}

/// [`Transport`] over the first `btleplug` adapter.
#[derive(Debug, Clone)]
pub struct BtleTransport {
    adapter: Adapter,
}

impl BtleTransport {
    /// Open the first adapter.
    ///
    /// # Errors
    ///
    /// [`Error::TransportUnavailable`] when there is no adapter or no stack.
    pub async fn new() -> Result<Self> {
        let adapter = get_adapter().await?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }
        Ok(Self { adapter })
    }

    /// Wrap an adapter obtained elsewhere.
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_of(
        &self,
        id: &PeripheralId,
    ) -> Option<(PeripheralHandle, Option<i16>, Vec<Uuid>)> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let identifier = peripheral_identifier(&properties.address.to_string(), id);
        Some((
            PeripheralHandle::new(identifier, properties.local_name),
            properties.rssi,
            properties.services,
        ))
    }

    async fn find_peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let address = match peripheral.properties().await {
                Ok(Some(props)) => props.address.to_string(),
                _ => continue,
            };
            if peripheral_identifier(&address, &peripheral.id()) == handle.id {
                return Ok(peripheral);
            }
        }
        Err(Error::connection_lost(&handle.id))
    }
}

#[async_trait]
impl Transport for BtleTransport {
    #[tracing::instrument(level = "info", skip(self))]
    async fn start_scan(&self, service: Uuid) -> Result<ScanEvents> {
        let central_events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| Error::ScanFailure(e.to_string()))?;

        let transport = self.clone();
        let advertisements = central_events.filter_map(move |event| {
            let transport = transport.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let (peripheral, rssi, services) = transport.handle_of(&id).await?;
                // Not every stack honours the scan filter
                if !services.contains(&service) {
                    return None;
                }
                Some(ScanEvent::Advertisement { peripheral, rssi })
            }
        });
        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(peripheral = %peripheral))]
    async fn open(&self, peripheral: &PeripheralHandle) -> Result<Arc<dyn Link>> {
        let inner = self.find_peripheral(peripheral).await?;
        let (local, _) = broadcast::channel(16);
        Ok(Arc::new(BtleLink {
            adapter: self.adapter.clone(),
            peripheral: inner,
            handle: peripheral.clone(),
            local,
        }))
    }
}

/// [`Link`] over a `btleplug` peripheral.
///
/// Connect and discovery outcomes are re-published on an internal channel so
/// that they reach the event stream alongside notifications and adapter
/// disconnect events.
pub struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    handle: PeripheralHandle,
    local: broadcast::Sender<LinkEvent>,
}

impl std::fmt::Debug for BtleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleLink")
            .field("handle", &self.handle)
            .finish()
    }
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                Error::characteristic_not_found(uuid.to_string(), self.peripheral.services().len())
            })
    }
}

#[async_trait]
impl Link for BtleLink {
    fn peripheral(&self) -> &PeripheralHandle {
        &self.handle
    }

    async fn events(&self) -> Result<LinkEvents> {
        let local = stream::unfold(self.local.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Link event stream lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        let notifications = self.peripheral.notifications().await?.map(|n| LinkEvent::ValueChanged {
            characteristic: n.uuid,
            value: n.value,
        });

        let id = self.peripheral.id();
        let dropped = self.adapter.events().await?.filter_map(move |event| {
            let matches = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
            async move { matches.then_some(LinkEvent::Disconnected) }
        });

        Ok(stream::select_all([local.boxed(), notifications.boxed(), dropped.boxed()]).boxed())
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        let _ = self.local.send(LinkEvent::Connected(catalog_of(&self.peripheral)));
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral.discover_services().await?;
        let _ = self
            .local
            .send(LinkEvent::ServicesDiscovered(catalog_of(&self.peripheral)));
        Ok(())
    }

    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        if enabled {
            self.peripheral.subscribe(&characteristic).await?;
        } else {
            self.peripheral.unsubscribe(&characteristic).await?;
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        match characteristic.descriptors.iter().find(|d| d.uuid == descriptor) {
            Some(d) => {
                self.peripheral.write_descriptor(d, value).await?;
            }
            None => {
                // CoreBluetooth hides the configuration descriptor; set_notify already wrote it
                debug!(
                    "Descriptor {} not exposed on {}, skipping write",
                    descriptor, characteristic.uuid
                );
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
