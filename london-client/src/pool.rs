//! Connection pooling.

use crate::connection::{DeviceConnection, TcpConnection, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{ClientError, Step};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Source of ready connections.
///
/// Every connection handed out by [`acquire`](ConnectionPool::acquire) must be
/// given back through [`release`](ConnectionPool::release) exactly once.
pub trait ConnectionPool: Send + Sync {
    type Conn: DeviceConnection;

    /// Checks a connection out, waiting for one to become available.
    fn acquire(&self) -> impl Future<Output = Result<Self::Conn, ClientError>> + Send;

    /// Returns a connection. Unhealthy connections must not be handed out again.
    fn release(&self, conn: Self::Conn, healthy: bool);
}

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time an idle connection is kept open.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(45);

/// Default pause between returning a connection and handing it out again.
pub const DEFAULT_REUSE_DELAY: Duration = Duration::from_millis(400);

/// TCP pool options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Device address (`host:port`).
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Idle connections older than this are closed.
    pub idle_ttl: Duration,
    /// Minimum time between a release and the next checkout of the same connection.
    pub reuse_delay: Duration,
    /// Maximum connections checked out at once.
    pub max_connections: usize,
    /// Read buffer limit per connection.
    pub max_frame_size: usize,
}

impl PoolOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_ttl: DEFAULT_IDLE_TTL,
            reuse_delay: DEFAULT_REUSE_DELAY,
            max_connections: 1,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_reuse_delay(mut self, delay: Duration) -> Self {
        self.reuse_delay = delay;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

struct IdleConnection {
    conn: TcpConnection,
    returned_at: Instant,
}

/// A TCP connection checked out of a [`TcpPool`].
///
/// Holds one of the pool's permits until it is released or dropped.
#[derive(Debug)]
pub struct PooledConnection {
    conn: TcpConnection,
    _permit: OwnedSemaphorePermit,
}

impl DeviceConnection for PooledConnection {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf).await
    }

    async fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        self.conn.read_until(terminator).await
    }
}

/// Pool of TCP connections to a single device.
pub struct TcpPool {
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

impl TcpPool {
    pub fn new(options: PoolOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_connections.max(1)));
        Self {
            options,
            permits,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Returns the number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Returns the number of connections that could be checked out right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Closes idle connections past their TTL. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.options.idle_ttl;
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|c| c.returned_at.elapsed() < ttl);
        let evicted = before - idle.len();
        if evicted > 0 {
            tracing::debug!(
                "Evicted {} idle connection(s) to {}",
                evicted,
                self.options.addr
            );
        }
        evicted
    }

    async fn dial(&self) -> Result<TcpConnection, ClientError> {
        let conn = TcpConnection::connect(&self.options.addr, self.options.connect_timeout)
            .await
            .map_err(|e| {
                tracing::debug!("Connection to {} failed: {}", self.options.addr, e);
                ClientError::io(Step::Acquire, e)
            })?;

        tracing::debug!("Connected to {}", conn.peer_addr());
        Ok(conn.with_max_frame_size(self.options.max_frame_size))
    }

    /// Waits out the reuse delay and drains anything the device sent meanwhile.
    async fn revive(&self, idle: IdleConnection) -> Option<TcpConnection> {
        tokio::time::sleep_until(idle.returned_at + self.options.reuse_delay).await;

        let mut conn = idle.conn;
        match conn.discard_pending() {
            Ok(0) => Some(conn),
            Ok(n) => {
                tracing::debug!("Discarded {} stale byte(s) from {}", n, conn.peer_addr());
                Some(conn)
            }
            Err(e) => {
                tracing::debug!("Idle connection to {} is gone: {}", conn.peer_addr(), e);
                None
            }
        }
    }
}

impl ConnectionPool for TcpPool {
    type Conn = PooledConnection;

    async fn acquire(&self) -> Result<PooledConnection, ClientError> {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            ClientError::io(
                Step::Acquire,
                io::Error::new(io::ErrorKind::Other, "connection pool closed"),
            )
        })?;

        self.evict_idle();

        loop {
            let idle = self.idle.lock().pop();
            let conn = match idle {
                Some(idle) => match self.revive(idle).await {
                    Some(conn) => conn,
                    None => continue,
                },
                None => self.dial().await?,
            };

            return Ok(PooledConnection {
                conn,
                _permit: permit,
            });
        }
    }

    fn release(&self, conn: PooledConnection, healthy: bool) {
        let PooledConnection { conn, _permit } = conn;

        if !healthy {
            tracing::debug!("Closing connection to {}", conn.peer_addr());
            return;
        }

        // Park the connection before the permit is returned
        self.idle.lock().push(IdleConnection {
            conn,
            returned_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use london_protocol::ETX;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts connections and echoes every byte back; returns the accept count.
    async fn echo_device() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    fn options(addr: &str) -> PoolOptions {
        PoolOptions::new(addr).with_reuse_delay(Duration::ZERO)
    }

    #[test]
    fn test_options_defaults() {
        let options = PoolOptions::new("10.0.0.5:1023");
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.idle_ttl, Duration::from_secs(45));
        assert_eq!(options.reuse_delay, Duration::from_millis(400));
        assert_eq!(options.max_connections, 1);
        assert_eq!(options.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_options_max_connections_floor() {
        let options = PoolOptions::new("10.0.0.5:1023").with_max_connections(0);
        assert_eq!(options.max_connections, 1);
    }

    #[tokio::test]
    async fn test_healthy_connection_is_reused() {
        let (addr, accepted) = echo_device().await;
        let pool = TcpPool::new(options(&addr));

        let mut conn = pool.acquire().await.unwrap();
        conn.write(&[0x01, ETX]).await.unwrap();
        assert_eq!(conn.read_until(ETX).await.unwrap(), vec![0x01, ETX]);
        pool.release(conn, true);
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.acquire().await.unwrap();
        conn.write(&[0x02, ETX]).await.unwrap();
        assert_eq!(conn.read_until(ETX).await.unwrap(), vec![0x02, ETX]);
        pool.release(conn, true);

        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_dropped() {
        let (addr, accepted) = echo_device().await;
        let pool = TcpPool::new(options(&addr));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checkout_is_exclusive() {
        let (addr, _accepted) = echo_device().await;
        let pool = Arc::new(TcpPool::new(options(&addr)));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        // A second checkout waits until the first connection comes back
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                pool.release(conn, true);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        pool.release(conn, true);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_idle_ttl_eviction() {
        let (addr, accepted) = echo_device().await;
        let pool = TcpPool::new(options(&addr).with_idle_ttl(Duration::from_millis(20)));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.idle_count(), 0);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true);
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_bytes_discarded_on_reuse() {
        let (addr, _accepted) = echo_device().await;
        let pool = TcpPool::new(options(&addr));

        // Leave an echoed frame unread on the connection
        let mut conn = pool.acquire().await.unwrap();
        conn.write(&[0x09, ETX]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(conn, true);

        let mut conn = pool.acquire().await.unwrap();
        conn.write(&[0x0A, ETX]).await.unwrap();
        assert_eq!(conn.read_until(ETX).await.unwrap(), vec![0x0A, ETX]);
        pool.release(conn, true);
    }

    #[tokio::test]
    async fn test_acquire_unreachable_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = TcpPool::new(options(&addr));
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Acquire));

        // The permit is returned on failure
        assert_eq!(pool.available(), 1);
    }
}
