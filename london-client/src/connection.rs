//! Device connections.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default limit on bytes buffered while waiting for a terminator (1 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// A byte stream to a DSP, checked out of a [`ConnectionPool`](crate::pool::ConnectionPool).
///
/// Deadlines are applied by the caller; implementations only move bytes.
pub trait DeviceConnection: Send {
    /// Writes `buf` and returns how many bytes were accepted by the transport.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Reads up to and including the next `terminator` byte.
    ///
    /// Bytes received after the terminator are kept for the next call. End of
    /// stream before the terminator is an `UnexpectedEof` error.
    fn read_until(&mut self, terminator: u8) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// A TCP connection to a DSP.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl TcpConnection {
    /// Connects to `addr` (`host:port`).
    pub async fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        tracing::debug!("Connecting to {}...", addr);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection to {} timed out", addr);
                io::Error::new(io::ErrorKind::TimedOut, "connection timed out")
            })??;

        Self::new(stream)
    }

    /// Wraps an established stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        // Commands are tiny; don't let Nagle hold them back
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr()?;

        Ok(Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(256),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(1);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the number of bytes read but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops everything already received without waiting for more.
    ///
    /// Returns the number of bytes discarded, or `UnexpectedEof` if the peer
    /// has closed the connection.
    pub fn discard_pending(&mut self) -> io::Result<usize> {
        let mut discarded = self.buffer.len();
        self.buffer.clear();

        let mut scratch = [0u8; 256];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(discarded),
                Err(e) => return Err(e),
            }
        }
    }
}

impl DeviceConnection for TcpConnection {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]).await? {
                0 => break,
                n => written += n,
            }
        }
        self.stream.flush().await?;
        Ok(written)
    }

    async fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.buffer[scanned..].iter().position(|&b| b == terminator) {
                let frame = self.buffer.split_to(scanned + pos + 1);
                return Ok(frame.to_vec());
            }
            scanned = self.buffer.len();

            if self.buffer.len() >= self.max_frame_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "no terminator within {} bytes from {}",
                        self.max_frame_size, self.peer
                    ),
                ));
            }

            self.buffer.reserve(256);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            tracing::trace!("Read {} bytes from {}", n, self.peer);

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before terminator",
                ));
            }
        }
    }
}
