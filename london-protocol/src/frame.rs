//! Direct Inject frame format.
//!
//! A frame wraps a logical payload followed by a one-byte XOR checksum.
//! Reserved control bytes inside the payload and checksum are escaped, so the
//! start and end markers only ever appear at the frame boundaries:
//!
//! ```text
//! +------+----------------------+----------+------+
//! | STX  | payload              | checksum | ETX  |
//! | 0x02 | n bytes (escaped)    | 1 (esc.) | 0x03 |
//! +------+----------------------+----------+------+
//! ```
//!
//! Escaping replaces a reserved byte `b` with the pair `[ESC, b + 0x80]`.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Start of frame.
pub const STX: u8 = 0x02;
/// End of frame.
pub const ETX: u8 = 0x03;
/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;
/// Escape prefix.
pub const ESC: u8 = 0x1B;

/// Added to a reserved byte to form the second byte of its escape pair.
const ESCAPE_OFFSET: u8 = 0x80;

fn is_reserved(byte: u8) -> bool {
    matches!(byte, STX | ETX | ACK | NAK | ESC)
}

/// XOR of every byte in `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |sum, b| sum ^ b)
}

/// Replaces every reserved byte with its two-byte escape sequence.
pub fn escape(body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() * 2);
    for &byte in body {
        if is_reserved(byte) {
            out.put_u8(ESC);
            out.put_u8(byte + ESCAPE_OFFSET);
        } else {
            out.put_u8(byte);
        }
    }
    out
}

/// Reverses [`escape`].
///
/// An escape byte must be followed by a reserved byte plus `0x80`; anything
/// else, including a trailing escape byte, is a malformed frame.
pub fn unescape(body: &[u8]) -> Result<BytesMut, ProtocolError> {
    let mut out = BytesMut::with_capacity(body.len());
    let mut bytes = body.iter().copied();

    while let Some(byte) = bytes.next() {
        if byte != ESC {
            out.put_u8(byte);
            continue;
        }

        let escaped = bytes
            .next()
            .ok_or_else(|| ProtocolError::MalformedFrame("dangling escape byte".to_string()))?;
        let original = escaped.wrapping_sub(ESCAPE_OFFSET);
        if !is_reserved(original) {
            return Err(ProtocolError::MalformedFrame(format!(
                "invalid escape sequence {:02x} {:02x}",
                ESC, escaped
            )));
        }
        out.put_u8(original);
    }

    Ok(out)
}

/// A Direct Inject frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical payload, unescaped and without the checksum byte.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame carrying the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the frame into wire bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::with_capacity(self.payload.len() + 1);
        body.put_slice(&self.payload);
        body.put_u8(checksum(&self.payload));

        let escaped = escape(&body);
        if escaped.contains(&STX) {
            return Err(ProtocolError::ProtocolViolation(
                "escaped frame body contains STX",
            ));
        }
        if escaped.contains(&ETX) {
            return Err(ProtocolError::ProtocolViolation(
                "escaped frame body contains ETX",
            ));
        }

        let mut buf = BytesMut::with_capacity(escaped.len() + 2);
        buf.put_u8(STX);
        buf.put_slice(&escaped);
        buf.put_u8(ETX);

        Ok(buf)
    }

    /// Decodes one complete frame, from STX to ETX inclusive.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.first() != Some(&STX) {
            return Err(ProtocolError::MalformedFrame(
                "frame must begin with STX".to_string(),
            ));
        }
        if buf.len() < 2 || buf.last() != Some(&ETX) {
            return Err(ProtocolError::MalformedFrame(
                "frame must end with ETX".to_string(),
            ));
        }

        let inner = &buf[1..buf.len() - 1];
        if inner.contains(&STX) {
            return Err(ProtocolError::MalformedFrame(
                "unexpected STX inside frame".to_string(),
            ));
        }
        if inner.contains(&ETX) {
            return Err(ProtocolError::MalformedFrame(
                "unexpected ETX inside frame".to_string(),
            ));
        }

        let mut body = unescape(inner)?;
        let actual = match body.last() {
            Some(&sum) => sum,
            None => {
                return Err(ProtocolError::MalformedFrame(
                    "frame has no checksum byte".to_string(),
                ))
            }
        };
        body.truncate(body.len() - 1);

        let expected = checksum(&body);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            payload: body.freeze(),
        })
    }
}
