//! Bluetooth UUIDs for the Heart Rate service.
//!
//! Every identifier here is a 16-bit SIG assigned number expanded onto the
//! Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID that 16-bit assigned numbers are expanded onto.
pub const BLUETOOTH_BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit assigned number into a full 128-bit UUID.
///
/// ```
/// use pulse_types::uuid::{from_short, HEART_RATE_SERVICE};
///
/// assert_eq!(from_short(0x180D), HEART_RATE_SERVICE);
/// ```
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

// --- Services ---

/// Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

// --- Characteristics ---

/// Heart Rate Measurement characteristic (0x2A37), notify only.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Body Sensor Location characteristic (0x2A38).
pub const BODY_SENSOR_LOCATION: Uuid = uuid!("00002a38-0000-1000-8000-00805f9b34fb");

/// Heart Rate Control Point characteristic (0x2A39).
pub const HEART_RATE_CONTROL_POINT: Uuid = uuid!("00002a39-0000-1000-8000-00805f9b34fb");

// --- Descriptors ---

/// Client Characteristic Configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD value that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value that disables notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Human-readable name for the identifiers this crate knows about.
pub fn short_name(uuid: &Uuid) -> Option<&'static str> {
    match *uuid {
        HEART_RATE_SERVICE => Some("Heart Rate"),
        HEART_RATE_MEASUREMENT => Some("Heart Rate Measurement"),
        BODY_SENSOR_LOCATION => Some("Body Sensor Location"),
        HEART_RATE_CONTROL_POINT => Some("Heart Rate Control Point"),
        CLIENT_CHARACTERISTIC_CONFIG => Some("Client Characteristic Configuration"),
        _ => None,
    }
}
