//! Direct Inject commands.
//!
//! Logical layout before the checksum is appended and the frame is escaped:
//!
//! ```text
//! +--------+-----------+------+-------+----------+---------+
//! | opcode | node      | vdev | block | selector | payload |
//! | 1 byte | 2 (0x0000)| 0x03 | 5     | 2        | 4       |
//! +--------+-----------+------+-------+----------+---------+
//! ```

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::{MIN_SUBSCRIBE_INTERVAL, VIRTUAL_DEVICE};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Length of a block address in bytes.
pub const BLOCK_LEN: usize = 5;

/// Length of a command payload in bytes.
pub const PAYLOAD_LEN: usize = 4;

/// Length of the logical command bytes (without checksum).
pub const COMMAND_LEN: usize = 1 + 2 + 1 + BLOCK_LEN + 2 + PAYLOAD_LEN;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Set,
    SetPercent,
    Subscribe,
    Unsubscribe,
    SubscribePercent,
    UnsubscribePercent,
}

impl Method {
    /// Returns the wire opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            Method::Set => 0x88,
            Method::SetPercent => 0x8D,
            Method::Subscribe => 0x89,
            Method::Unsubscribe => 0x8A,
            Method::SubscribePercent => 0x8E,
            Method::UnsubscribePercent => 0x8F,
        }
    }

    pub fn set(units: Units) -> Self {
        match units {
            Units::Absolute => Method::Set,
            Units::Percent => Method::SetPercent,
        }
    }

    pub fn subscribe(units: Units) -> Self {
        match units {
            Units::Absolute => Method::Subscribe,
            Units::Percent => Method::SubscribePercent,
        }
    }

    pub fn unsubscribe(units: Units) -> Self {
        match units {
            Units::Absolute => Method::Unsubscribe,
            Units::Percent => Method::UnsubscribePercent,
        }
    }

    /// Returns the units this method's payload is expressed in.
    pub fn units(&self) -> Units {
        match self {
            Method::Set | Method::Subscribe | Method::Unsubscribe => Units::Absolute,
            Method::SetPercent | Method::SubscribePercent | Method::UnsubscribePercent => {
                Units::Percent
            }
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Set => write!(f, "SET"),
            Method::SetPercent => write!(f, "SET_PERCENT"),
            Method::Subscribe => write!(f, "SUBSCRIBE"),
            Method::Unsubscribe => write!(f, "UNSUBSCRIBE"),
            Method::SubscribePercent => write!(f, "SUBSCRIBE_PERCENT"),
            Method::UnsubscribePercent => write!(f, "UNSUBSCRIBE_PERCENT"),
        }
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "set" => Ok(Method::Set),
            "set-percent" => Ok(Method::SetPercent),
            "subscribe" => Ok(Method::Subscribe),
            "unsubscribe" => Ok(Method::Unsubscribe),
            "subscribe-percent" => Ok(Method::SubscribePercent),
            "unsubscribe-percent" => Ok(Method::UnsubscribePercent),
            other => Err(ProtocolError::InvalidArgument(format!(
                "unknown method: {}",
                other
            ))),
        }
    }
}

/// Whether a payload carries an absolute value or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Units {
    Absolute,
    Percent,
}

/// State variables addressable on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateVariable {
    Gain,
    Mute,
    Polarity,
}

impl StateVariable {
    /// Returns the 2-byte wire selector.
    pub fn selector(&self) -> [u8; 2] {
        match self {
            StateVariable::Gain => [0x00, 0x00],
            StateVariable::Mute => [0x00, 0x01],
            StateVariable::Polarity => [0x00, 0x02],
        }
    }
}

impl fmt::Display for StateVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateVariable::Gain => write!(f, "gain"),
            StateVariable::Mute => write!(f, "mute"),
            StateVariable::Polarity => write!(f, "polarity"),
        }
    }
}

impl FromStr for StateVariable {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gain" | "volume" => Ok(StateVariable::Gain),
            "mute" => Ok(StateVariable::Mute),
            "polarity" => Ok(StateVariable::Polarity),
            other => Err(ProtocolError::InvalidArgument(format!(
                "unknown state variable: {}",
                other
            ))),
        }
    }
}

/// Address of a processing block (channel) on the DSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block([u8; BLOCK_LEN]);

impl Block {
    pub fn new(address: [u8; BLOCK_LEN]) -> Self {
        Self(address)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_LEN] {
        &self.0
    }
}

impl FromStr for Block {
    type Err = ProtocolError;

    /// Parses a block from its hex form, e.g. `000000010A`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| {
            ProtocolError::InvalidArgument(format!("failed to decode block {:?}: {}", s, e))
        })?;
        let address: [u8; BLOCK_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ProtocolError::InvalidArgument(format!(
                "block must be {} bytes, got {}",
                BLOCK_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(address))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// A single addressed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub method: Method,
    pub state: StateVariable,
    pub block: Block,
    pub payload: [u8; PAYLOAD_LEN],
}

impl Command {
    /// Creates a command from an arbitrary payload slice.
    pub fn new(
        method: Method,
        state: StateVariable,
        block: Block,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        let payload: [u8; PAYLOAD_LEN] = payload.try_into().map_err(|_| {
            ProtocolError::InvalidArgument(format!(
                "payload must be {} bytes, got {}",
                PAYLOAD_LEN,
                payload.len()
            ))
        })?;

        Ok(Self {
            method,
            state,
            block,
            payload,
        })
    }

    /// Creates a set command.
    pub fn set(units: Units, state: StateVariable, block: Block, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            method: Method::set(units),
            state,
            block,
            payload,
        }
    }

    /// Creates a subscribe command reporting every `interval_ms` milliseconds.
    ///
    /// Intervals below [`MIN_SUBSCRIBE_INTERVAL`] are rejected.
    pub fn subscribe(
        units: Units,
        state: StateVariable,
        block: Block,
        interval_ms: u32,
    ) -> Result<Self, ProtocolError> {
        if interval_ms < MIN_SUBSCRIBE_INTERVAL {
            return Err(ProtocolError::InvalidArgument(format!(
                "subscribe interval must be at least {}ms, got {}ms",
                MIN_SUBSCRIBE_INTERVAL, interval_ms
            )));
        }
        Ok(Self::subscription(
            Method::subscribe(units),
            state,
            block,
            interval_ms,
        ))
    }

    /// Creates the unsubscribe command matching [`Command::subscribe`].
    pub fn unsubscribe(units: Units, state: StateVariable, block: Block) -> Self {
        Self::subscription(Method::unsubscribe(units), state, block, 0)
    }

    fn subscription(method: Method, state: StateVariable, block: Block, interval_ms: u32) -> Self {
        Self {
            method,
            state,
            block,
            payload: interval_ms.to_be_bytes(),
        }
    }

    /// Returns the logical command bytes, without checksum or escaping.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMAND_LEN);
        buf.put_u8(self.method.opcode());
        buf.put_u16(0x0000);
        buf.put_u8(VIRTUAL_DEVICE);
        buf.put_slice(self.block.as_bytes());
        buf.put_slice(&self.state.selector());
        buf.put_slice(&self.payload);
        buf
    }

    /// Encodes the command into a wire frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        Frame::new(self.to_bytes().freeze()).encode()
    }
}
