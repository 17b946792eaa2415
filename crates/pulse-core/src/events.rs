//! Session event system.
//!
//! Every component takes an [`EventDispatcher`] at construction and reports
//! discoveries, state changes, samples and failures through it. There is no
//! process-wide sink; whoever builds the components decides who listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use pulse_types::{ConnectionState, HeartRateSample, PeripheralHandle};

use crate::error::{Error, ErrorKind};

/// Events emitted by the scanner, device connections and the coordinator.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// Scanning started.
    ScanStarted,
    /// Scanning stopped.
    ScanStopped,
    /// The radio reported a scan failure.
    ScanFailed { message: String },
    /// A previously unseen peripheral advertised the Heart Rate service.
    Discovered {
        peripheral: PeripheralHandle,
        rssi: Option<i16>,
    },
    /// A connection moved to a new state.
    StateChanged {
        peripheral: PeripheralHandle,
        state: ConnectionState,
    },
    /// A fresh service catalog arrived.
    ServicesDiscovered {
        peripheral: PeripheralHandle,
        service_count: usize,
    },
    /// A heart-rate sample was decoded.
    Sample {
        peripheral: PeripheralHandle,
        sample: HeartRateSample,
    },
    /// A notification payload failed to decode.
    DecodeFailed {
        peripheral: PeripheralHandle,
        error: String,
    },
    /// An operation failed.
    Error {
        peripheral: Option<PeripheralHandle>,
        kind: ErrorKind,
        message: String,
    },
    /// A sample was handed to the persistence sink.
    Persisted { value: u16, timestamp_millis: i64 },
    /// The persistence sink rejected a sample.
    PersistFailed { message: String },
}

impl SessionEvent {
    /// Build an [`SessionEvent::Error`] from an error.
    pub fn error(peripheral: Option<&PeripheralHandle>, err: &Error) -> Self {
        SessionEvent::Error {
            peripheral: peripheral.cloned(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_subscriber() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 1);

        dispatcher.send(SessionEvent::ScanStarted);
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::ScanStarted));
    }

    #[test]
    fn test_send_without_receivers_is_ignored() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(SessionEvent::ScanStopped);
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::StateChanged {
            peripheral: PeripheralHandle::named("AA:BB", "Strap"),
            state: ConnectionState::Connecting,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state_changed\""));
        assert!(json.contains("\"state\":\"connecting\""));
    }

    #[test]
    fn test_error_event_from_error() {
        let event = SessionEvent::error(None, &Error::NotConnected);
        match event {
            SessionEvent::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::InvalidState);
                assert_eq!(message, "Not connected to device");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
