//! Payload conversions for status values.
//!
//! Status frames carry the value in the trailing bytes of the payload: a
//! single byte for switches (mute, polarity) and a 4-byte big-endian fixed
//! point number for percentages.

use crate::command::PAYLOAD_LEN;
use crate::error::ProtocolError;

/// Fixed-point scale of percentage payloads (16.16).
pub const VOLUME_SCALE: u32 = 65536;

/// Correction added to every volume the device reports.
///
/// Devices in the field read back one percent below the level that was set.
pub const DEVICE_VOLUME_OFFSET: i32 = 1;

const MAX_VOLUME: u8 = 100;

/// Encodes a switch state (mute, polarity) as a set payload.
pub fn switch_payload(on: bool) -> [u8; PAYLOAD_LEN] {
    [0x00, 0x00, 0x00, u8::from(on)]
}

/// Encodes a volume level in `0..=100` as a percentage payload.
pub fn volume_payload(level: u8) -> Result<[u8; PAYLOAD_LEN], ProtocolError> {
    if level > MAX_VOLUME {
        return Err(ProtocolError::InvalidArgument(format!(
            "volume must be between 0 and {}, got {}",
            MAX_VOLUME, level
        )));
    }
    Ok((u32::from(level) * VOLUME_SCALE).to_be_bytes())
}

fn parse_switch(payload: &[u8], name: &str) -> Result<bool, ProtocolError> {
    match payload.last() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        Some(other) => Err(ProtocolError::InvalidResponse(format!(
            "bad {} value {:#04x}",
            name, other
        ))),
        None => Err(ProtocolError::InvalidResponse(format!(
            "empty {} payload",
            name
        ))),
    }
}

/// Parses a mute status payload.
pub fn parse_mute(payload: &[u8]) -> Result<bool, ProtocolError> {
    parse_switch(payload, "mute")
}

/// Parses a polarity status payload; `true` means inverted.
pub fn parse_polarity(payload: &[u8]) -> Result<bool, ProtocolError> {
    parse_switch(payload, "polarity")
}

/// Parses a percentage status payload into a volume level.
///
/// The raw value is divided by [`VOLUME_SCALE`] rounding to nearest, then
/// `offset` is added and the result is clamped to `0..=100`.
pub fn parse_volume(payload: &[u8], offset: i32) -> Result<u8, ProtocolError> {
    if payload.len() < PAYLOAD_LEN {
        return Err(ProtocolError::InvalidResponse(format!(
            "volume payload must be at least {} bytes, got {}",
            PAYLOAD_LEN,
            payload.len()
        )));
    }

    let mut raw = [0u8; PAYLOAD_LEN];
    raw.copy_from_slice(&payload[payload.len() - PAYLOAD_LEN..]);
    let raw = i64::from(i32::from_be_bytes(raw));

    let scale = i64::from(VOLUME_SCALE);
    let level = (raw + scale / 2).div_euclid(scale) + i64::from(offset);

    Ok(level.clamp(0, i64::from(MAX_VOLUME)) as u8)
}
