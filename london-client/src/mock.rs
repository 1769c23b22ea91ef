//! In-memory pool for exercising transactions without a device.

use crate::connection::DeviceConnection;
use crate::error::{ClientError, Step};
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the next `read_until` does.
#[derive(Debug, Clone)]
pub(crate) enum MockRead {
    /// Returns these bytes.
    Frame(Vec<u8>),
    /// Never resolves.
    Hang,
    /// Fails with this kind.
    Fail(io::ErrorKind),
    /// Cancels the token, then returns these bytes.
    CancelThen(CancellationToken, Vec<u8>),
}

/// What the next `write` does. Once the script runs out, writes follow
/// `max_write` and `hang_writes`.
#[derive(Debug, Clone)]
pub(crate) enum MockWrite {
    /// Accepts the whole buffer.
    Accept,
    /// Never resolves.
    Hang,
    /// Fails with this kind.
    Fail(io::ErrorKind),
}

#[derive(Default)]
pub(crate) struct MockState {
    pub reads: VecDeque<MockRead>,
    pub writes: VecDeque<MockWrite>,
    pub written: Vec<Vec<u8>>,
    pub acquires: usize,
    pub releases: Vec<bool>,
    /// Caps the bytes accepted per write.
    pub max_write: Option<usize>,
    pub acquire_delay: Option<Duration>,
    pub hang_writes: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockPool {
    pub state: Arc<Mutex<MockState>>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, read: MockRead) {
        self.state.lock().reads.push_back(read);
    }

    pub fn push_write(&self, write: MockWrite) {
        self.state.lock().writes.push_back(write);
    }

    pub fn push_frame(&self, bytes: impl Into<Vec<u8>>) {
        self.push_read(MockRead::Frame(bytes.into()));
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn acquires(&self) -> usize {
        self.state.lock().acquires
    }

    pub fn releases(&self) -> Vec<bool> {
        self.state.lock().releases.clone()
    }
}

pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl DeviceConnection for MockConnection {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (scripted, hang) = {
            let mut state = self.state.lock();
            (state.writes.pop_front(), state.hang_writes)
        };

        match scripted {
            Some(MockWrite::Accept) => {
                self.state.lock().written.push(buf.to_vec());
                return Ok(buf.len());
            }
            Some(MockWrite::Hang) => std::future::pending::<()>().await,
            Some(MockWrite::Fail(kind)) => return Err(io::Error::from(kind)),
            None if hang => std::future::pending::<()>().await,
            None => {}
        }

        let mut state = self.state.lock();
        let n = state.max_write.map_or(buf.len(), |max| max.min(buf.len()));
        state.written.push(buf[..n].to_vec());
        Ok(n)
    }

    async fn read_until(&mut self, _terminator: u8) -> io::Result<Vec<u8>> {
        let next = self.state.lock().reads.pop_front();
        match next {
            Some(MockRead::Frame(bytes)) => Ok(bytes),
            Some(MockRead::Fail(kind)) => Err(io::Error::from(kind)),
            Some(MockRead::CancelThen(token, bytes)) => {
                token.cancel();
                Ok(bytes)
            }
            Some(MockRead::Hang) | None => std::future::pending().await,
        }
    }
}

impl ConnectionPool for MockPool {
    type Conn = MockConnection;

    async fn acquire(&self) -> Result<MockConnection, ClientError> {
        let delay = self.state.lock().acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.state.lock().acquires += 1;
        Ok(MockConnection {
            state: self.state.clone(),
        })
    }

    fn release(&self, _conn: MockConnection, healthy: bool) {
        self.state.lock().releases.push(healthy);
    }
}

/// Pool whose acquire always fails.
pub(crate) struct RefusingPool;

impl ConnectionPool for RefusingPool {
    type Conn = MockConnection;

    async fn acquire(&self) -> Result<MockConnection, ClientError> {
        Err(ClientError::io(
            Step::Acquire,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        ))
    }

    fn release(&self, _conn: MockConnection, _healthy: bool) {}
}
