//! Core types for heart-rate monitor sessions.

use core::fmt;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A remote device seen in an advertisement.
///
/// Handles compare and hash by `id` only: the same peripheral advertising
/// under a changed name is still the same peripheral.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralHandle {
    /// Transport identifier (MAC address on Linux/Windows, UUID on macOS).
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

impl PeripheralHandle {
    /// Create a handle with an identifier and optional name.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Create a handle with a name.
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, Some(name.into()))
    }

    /// The name if advertised, otherwise the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether this handle matches a user-supplied identifier or name.
    ///
    /// Identifiers match exactly (case-insensitive, colons optional); names
    /// match on a case-insensitive substring.
    pub fn matches(&self, query: &str) -> bool {
        let query_lower = query.to_lowercase();
        let id_lower = self.id.to_lowercase();
        if id_lower == query_lower || id_lower.replace(':', "") == query_lower.replace(':', "") {
            return true;
        }
        self.name
            .as_ref()
            .is_some_and(|n| n.to_lowercase().contains(&query_lower))
    }
}

impl PartialEq for PeripheralHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeripheralHandle {}

impl Hash for PeripheralHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Link state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No transport session.
    #[default]
    Disconnected,
    /// Connect requested, waiting for the transport.
    Connecting,
    /// Link is up.
    Connected,
    /// Service discovery in flight.
    Discovering,
    /// Heart Rate Measurement notifications enabled.
    Subscribed,
}

impl ConnectionState {
    /// Whether the link is up (connected, discovering or subscribed).
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Discovering | ConnectionState::Subscribed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Discovering => write!(f, "discovering"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// Snapshot of the services a peripheral exposes.
///
/// Replaced wholesale on every discovery event; never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServiceCatalog {
    services: BTreeMap<Uuid, Vec<Uuid>>,
}

impl ServiceCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service with its characteristics, in the order given.
    #[must_use]
    pub fn with_service(mut self, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.services.insert(service, characteristics);
        self
    }

    /// Whether the catalog holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Number of services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Characteristics of a service.
    pub fn characteristics(&self, service: &Uuid) -> Option<&[Uuid]> {
        self.services.get(service).map(Vec::as_slice)
    }

    /// Whether `characteristic` is listed under `service`.
    pub fn contains_characteristic(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.characteristics(service)
            .is_some_and(|chars| chars.contains(characteristic))
    }

    /// Iterate over services and their characteristics.
    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &[Uuid])> {
        self.services.iter().map(|(s, c)| (s, c.as_slice()))
    }

    /// String-keyed view for display and JSON output.
    pub fn to_display_map(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .iter()
            .map(|(service, chars)| {
                (
                    service.to_string(),
                    chars.iter().map(Uuid::to_string).collect(),
                )
            })
            .collect()
    }
}

impl FromIterator<(Uuid, Vec<Uuid>)> for ServiceCatalog {
    fn from_iter<I: IntoIterator<Item = (Uuid, Vec<Uuid>)>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}

/// A decoded heart-rate measurement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeartRateSample {
    /// Beats per minute.
    pub bpm: u16,
    /// RR intervals in seconds, in arrival order.
    pub rr_intervals: Vec<f64>,
    /// When the notification carrying this sample arrived.
    ///
    /// `None` straight out of the codec; stamped by the connection.
    #[cfg_attr(
        feature = "serde",
        serde(default, with = "time::serde::rfc3339::option")
    )]
    pub captured_at: Option<OffsetDateTime>,
}

impl HeartRateSample {
    /// A sample with no RR intervals and no timestamp.
    pub fn new(bpm: u16) -> Self {
        Self {
            bpm,
            rr_intervals: Vec::new(),
            captured_at: None,
        }
    }

    /// Attach RR intervals (seconds).
    #[must_use]
    pub fn with_rr_intervals(mut self, rr_intervals: Vec<f64>) -> Self {
        self.rr_intervals = rr_intervals;
        self
    }

    /// Attach the arrival timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, captured_at: OffsetDateTime) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    /// Arrival time as Unix milliseconds, if stamped.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.captured_at
            .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64)
    }
}

impl fmt::Display for HeartRateSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bpm", self.bpm)?;
        if !self.rr_intervals.is_empty() {
            let rr: Vec<String> = self
                .rr_intervals
                .iter()
                .map(|s| format!("{:.3}s", s))
                .collect();
            write!(f, " (RR {})", rr.join(", "))?;
        }
        Ok(())
    }
}

/// A persisted heart-rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StoredHeartRate {
    /// Beats per minute.
    pub value: u16,
    /// Capture time as Unix milliseconds.
    pub timestamp_millis: i64,
}

impl StoredHeartRate {
    /// Capture time as a UTC timestamp.
    pub fn captured_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.timestamp_millis) * 1_000_000)
            .ok()
    }
}
