//! Heart Rate Measurement (0x2A37) payload codec.
//!
//! The payload layout, per the Bluetooth SIG Heart Rate Service:
//!
//! | Bytes | Field | Present when |
//! |-------|-------|--------------|
//! | 1 | Flags | always |
//! | 1 or 2 | Heart rate value (uint8, or uint16 LE) | always; width from flag bit 0 |
//! | 2 | Energy expended (uint16 LE, kJ) | flag bit 3 |
//! | 2 × n | RR intervals (uint16 LE, 1/1024 s) | flag bit 4 |
//!
//! All multi-byte fields are little-endian. Energy expended is skipped and
//! sensor-contact bits are ignored.

use bytes::{Buf, BufMut};

use crate::error::{DecodeError, DecodeResult};
use crate::types::HeartRateSample;

/// Flag bits of the first payload byte.
pub mod flags {
    /// Heart rate value is uint16 rather than uint8.
    pub const VALUE_FORMAT_U16: u8 = 1 << 0;
    /// Sensor contact detected.
    pub const SENSOR_CONTACT_DETECTED: u8 = 1 << 1;
    /// Sensor contact feature supported.
    pub const SENSOR_CONTACT_SUPPORTED: u8 = 1 << 2;
    /// Energy expended field present.
    pub const ENERGY_EXPENDED_PRESENT: u8 = 1 << 3;
    /// One or more RR intervals present.
    pub const RR_INTERVAL_PRESENT: u8 = 1 << 4;
}

/// RR intervals are counted in 1/1024 second ticks.
pub const RR_TICKS_PER_SECOND: f64 = 1024.0;

/// Smallest payload that can decode: flags plus a uint8 value.
pub const MIN_PAYLOAD_BYTES: usize = 2;

/// Largest attribute value ATT allows.
pub const MAX_PAYLOAD_BYTES: usize = 512;

fn ensure(buf: &[u8], field: &'static str, needed: usize) -> DecodeResult<()> {
    if buf.remaining() < needed {
        return Err(DecodeError::truncated(field, needed, buf.remaining()));
    }
    Ok(())
}

/// Decode a Heart Rate Measurement payload.
///
/// The returned sample carries no timestamp; the receiver stamps arrival
/// time. Every read is bounds-checked first, so short buffers fail with
/// [`DecodeError::Truncated`] instead of reading past the end.
///
/// A single stray byte after one or more complete RR intervals is ignored.
///
/// The 16-bit value format is little-endian, like every multi-byte field of
/// the characteristic. A payload laid out big-endian, such as
/// `[0x01, 0x00, 0x4B]`, is not special-cased: it decodes to 19200 bpm, not 75.
///
/// # Examples
///
/// ```
/// use pulse_types::codec::decode;
///
/// let sample = decode(&[0x00, 0x4B]).unwrap();
/// assert_eq!(sample.bpm, 75);
/// assert!(sample.rr_intervals.is_empty());
/// ```
///
/// # Errors
///
/// - [`DecodeError::Truncated`] when a field declared by the flags does not fit.
/// - [`DecodeError::Malformed`] when the payload exceeds [`MAX_PAYLOAD_BYTES`].
#[must_use = "decoding returns a Result that should be handled"]
pub fn decode(payload: &[u8]) -> DecodeResult<HeartRateSample> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(DecodeError::Malformed(format!(
            "payload of {} bytes exceeds the {} byte attribute limit",
            payload.len(),
            MAX_PAYLOAD_BYTES
        )));
    }

    let mut buf = payload;

    ensure(buf, "flags", 1)?;
    let flag_bits = buf.get_u8();

    let bpm = if flag_bits & flags::VALUE_FORMAT_U16 != 0 {
        ensure(buf, "heart rate value (uint16)", 2)?;
        buf.get_u16_le()
    } else {
        ensure(buf, "heart rate value (uint8)", 1)?;
        u16::from(buf.get_u8())
    };

    if flag_bits & flags::ENERGY_EXPENDED_PRESENT != 0 {
        ensure(buf, "energy expended", 2)?;
        buf.advance(2);
    }

    let mut rr_intervals = Vec::new();
    if flag_bits & flags::RR_INTERVAL_PRESENT != 0 {
        ensure(buf, "rr interval", 2)?;
        while buf.remaining() >= 2 {
            rr_intervals.push(f64::from(buf.get_u16_le()) / RR_TICKS_PER_SECOND);
        }
    }

    Ok(HeartRateSample::new(bpm).with_rr_intervals(rr_intervals))
}

/// Convert seconds to 1/1024 s ticks, saturating at the uint16 range.
pub fn seconds_to_ticks(seconds: f64) -> u16 {
    (seconds * RR_TICKS_PER_SECOND)
        .round()
        .clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Encode a sample as a Heart Rate Measurement payload.
///
/// Uses the uint8 value format when `bpm` fits in a byte, uint16 otherwise.
/// RR intervals are rounded to the nearest tick. The timestamp is not part
/// of the wire format.
pub fn encode(sample: &HeartRateSample) -> Vec<u8> {
    encode_with_format(sample, sample.bpm > u16::from(u8::MAX))
}

/// Encode a sample, choosing the value width explicitly.
///
/// With `wide == false` a `bpm` above 255 is saturated to 255.
pub fn encode_with_format(sample: &HeartRateSample, wide: bool) -> Vec<u8> {
    let mut flag_bits = 0u8;
    if wide {
        flag_bits |= flags::VALUE_FORMAT_U16;
    }
    if !sample.rr_intervals.is_empty() {
        flag_bits |= flags::RR_INTERVAL_PRESENT;
    }

    let mut out = Vec::with_capacity(3 + sample.rr_intervals.len() * 2);
    out.put_u8(flag_bits);
    if wide {
        out.put_u16_le(sample.bpm);
    } else {
        out.put_u8(sample.bpm.min(u16::from(u8::MAX)) as u8);
    }
    for seconds in &sample.rr_intervals {
        out.put_u16_le(seconds_to_ticks(*seconds));
    }
    out
}
