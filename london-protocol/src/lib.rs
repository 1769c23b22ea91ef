//! # london-protocol
//!
//! Wire protocol implementation for BSS London Direct Inject.
//!
//! This crate provides:
//! - Framing with STX/ETX markers, byte stuffing and an XOR checksum
//! - Command construction for set/subscribe/unsubscribe requests
//! - Parsing of mute, polarity and volume status payloads
//! - Error types and protocol constants

pub mod command;
pub mod error;
pub mod frame;
pub mod response;

pub use command::{Block, Command, Method, StateVariable, Units, BLOCK_LEN, PAYLOAD_LEN};
pub use error::ProtocolError;
pub use frame::{checksum, Frame, ACK, ESC, ETX, NAK, STX};
pub use response::{
    parse_mute, parse_polarity, parse_volume, switch_payload, volume_payload,
    DEVICE_VOLUME_OFFSET, VOLUME_SCALE,
};

/// Default TCP port of the Direct Inject service.
pub const DEFAULT_PORT: u16 = 1023;

/// Virtual device id addressed by every command.
pub const VIRTUAL_DEVICE: u8 = 0x03;

/// Shortest subscription interval the device accepts, in milliseconds.
pub const MIN_SUBSCRIBE_INTERVAL: u32 = 50;
