//! Transaction coordinator.
//!
//! A read transaction subscribes to a state variable, waits for the first
//! status frame and unsubscribes again. A write transaction sends a single
//! set command without waiting for anything.
//!
//! Every step runs under the smaller of its own timeout and whatever is left
//! of the overall deadline, and stops early if the caller's [`Context`] is
//! cancelled. The connection is returned to the pool exactly once, whatever
//! the outcome.

use crate::connection::DeviceConnection;
use crate::context::{Context, Interrupt};
use crate::error::{ClientError, Step};
use crate::pool::ConnectionPool;
use bytes::Bytes;
use london_protocol::{Frame, ETX};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Default overall transaction timeout.
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for the status frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Transaction timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Bound on the whole transaction, acquire included.
    pub overall_timeout: Duration,
    /// Bound on each write.
    pub write_timeout: Duration,
    /// Bound on waiting for the status frame.
    pub read_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl TransactionConfig {
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.overall_timeout.is_zero()
            || self.write_timeout.is_zero()
            || self.read_timeout.is_zero()
        {
            return Err(ClientError::Config(
                "transaction timeouts must be non-zero".to_string(),
            ));
        }
        if self.write_timeout > self.overall_timeout {
            return Err(ClientError::Config(format!(
                "write timeout {:?} exceeds overall timeout {:?}",
                self.write_timeout, self.overall_timeout
            )));
        }
        if self.read_timeout > self.overall_timeout {
            return Err(ClientError::Config(format!(
                "read timeout {:?} exceeds overall timeout {:?}",
                self.read_timeout, self.overall_timeout
            )));
        }
        Ok(())
    }
}

/// Where a transaction is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Acquiring,
    Writing(Step),
    AwaitingResponse,
    Decoding,
    Success,
    Failed(Option<Step>),
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Idle => write!(f, "idle"),
            TransactionState::Acquiring => write!(f, "acquiring"),
            TransactionState::Writing(step) => write!(f, "writing ({})", step),
            TransactionState::AwaitingResponse => write!(f, "awaiting response"),
            TransactionState::Decoding => write!(f, "decoding"),
            TransactionState::Success => write!(f, "success"),
            TransactionState::Failed(Some(step)) => write!(f, "failed ({})", step),
            TransactionState::Failed(None) => write!(f, "failed"),
        }
    }
}

/// A checked-out connection that goes back to its pool exactly once.
///
/// Dropping a lease without calling [`release`](Lease::release) returns the
/// connection as unhealthy.
struct Lease<'a, P: ConnectionPool> {
    pool: &'a P,
    conn: Option<P::Conn>,
}

impl<'a, P: ConnectionPool> Lease<'a, P> {
    fn new(pool: &'a P, conn: P::Conn) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn conn(&mut self) -> &mut P::Conn {
        self.conn.as_mut().expect("connection present until release")
    }

    fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, healthy);
        }
    }
}

impl<P: ConnectionPool> Drop for Lease<'_, P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }
}

/// A single exchange with a device.
pub struct Transaction<'a, P: ConnectionPool> {
    pool: &'a P,
    config: TransactionConfig,
    ctx: Context,
    state: TransactionState,
}

impl<'a, P: ConnectionPool> Transaction<'a, P> {
    /// Creates a transaction bounded by `ctx` and the overall timeout.
    pub fn new(pool: &'a P, config: TransactionConfig, ctx: &Context) -> Self {
        Self {
            pool,
            config,
            ctx: ctx.clone().with_timeout(config.overall_timeout),
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Subscribes, waits for the first status frame, then unsubscribes.
    ///
    /// Returns the decoded frame payload.
    pub async fn read(mut self, subscribe: &[u8], unsubscribe: &[u8]) -> Result<Bytes, ClientError> {
        let result = self.run_read(subscribe, unsubscribe).await;
        self.finish(&result);
        result
    }

    /// Sends a command without waiting for a reply.
    pub async fn write(mut self, command: &[u8]) -> Result<(), ClientError> {
        let result = self.run_write(command).await;
        self.finish(&result);
        result
    }

    async fn run_read(&mut self, subscribe: &[u8], unsubscribe: &[u8]) -> Result<Bytes, ClientError> {
        let mut lease = self.acquire().await?;

        self.transition(TransactionState::Writing(Step::Subscribe));
        if let Err(err) = self.send(&mut lease, Step::Subscribe, subscribe).await {
            // The device may have seen part or all of an interrupted subscribe
            if is_interrupt(&err) {
                self.abandon_subscription(&mut lease, unsubscribe).await;
            }
            return Err(err);
        }

        self.transition(TransactionState::AwaitingResponse);
        let raw = match self.receive(&mut lease).await {
            Ok(raw) => raw,
            Err(err) => {
                self.abandon_subscription(&mut lease, unsubscribe).await;
                return Err(err);
            }
        };

        self.transition(TransactionState::Writing(Step::Unsubscribe));
        if let Err(err) = self.send(&mut lease, Step::Unsubscribe, unsubscribe).await {
            if is_interrupt(&err) {
                self.abandon_subscription(&mut lease, unsubscribe).await;
            }
            return Err(err);
        }

        self.transition(TransactionState::Decoding);
        match Frame::decode(&raw) {
            Ok(frame) => {
                lease.release(true);
                Ok(frame.payload)
            }
            Err(e) => {
                lease.release(false);
                Err(e.into())
            }
        }
    }

    async fn run_write(&mut self, command: &[u8]) -> Result<(), ClientError> {
        let mut lease = self.acquire().await?;

        self.transition(TransactionState::Writing(Step::Command));
        self.send(&mut lease, Step::Command, command).await?;

        lease.release(true);
        Ok(())
    }

    async fn acquire(&mut self) -> Result<Lease<'a, P>, ClientError> {
        self.transition(TransactionState::Acquiring);

        let pool = self.pool;
        let conn = self
            .guarded(Step::Acquire, self.config.overall_timeout, pool.acquire())
            .await?;
        Ok(Lease::new(pool, conn))
    }

    async fn send(&self, lease: &mut Lease<'a, P>, step: Step, buf: &[u8]) -> Result<(), ClientError> {
        tracing::debug!("Sending {}: {}", step, hex::encode(buf));

        let conn = lease.conn();
        let written = self
            .guarded(step, self.config.write_timeout, async move {
                conn.write(buf).await.map_err(|e| ClientError::io(step, e))
            })
            .await?;

        if written < buf.len() {
            return Err(ClientError::ShortWrite {
                step,
                written,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    async fn receive(&self, lease: &mut Lease<'a, P>) -> Result<Vec<u8>, ClientError> {
        let conn = lease.conn();
        let raw = self
            .guarded(Step::Response, self.config.read_timeout, async move {
                conn.read_until(ETX)
                    .await
                    .map_err(|e| ClientError::io(Step::Response, e))
            })
            .await?;

        tracing::debug!("Received: {}", hex::encode(&raw));
        Ok(raw)
    }

    /// Best-effort unsubscribe once a read has gone wrong after the subscribe
    /// may have reached the device. Runs under a fresh write timeout,
    /// independent of the caller's context; the outcome is only logged.
    async fn abandon_subscription(&self, lease: &mut Lease<'a, P>, unsubscribe: &[u8]) {
        let conn = lease.conn();
        match tokio::time::timeout(self.config.write_timeout, conn.write(unsubscribe)).await {
            Ok(Ok(n)) if n == unsubscribe.len() => {
                tracing::debug!("Unsubscribed after failed read");
            }
            Ok(Ok(n)) => {
                tracing::warn!(
                    "Unsubscribe after failed read wrote {}/{} bytes",
                    n,
                    unsubscribe.len()
                );
            }
            Ok(Err(e)) => tracing::warn!("Unsubscribe after failed read failed: {}", e),
            Err(_) => tracing::warn!("Unsubscribe after failed read timed out"),
        }
    }

    /// Runs `fut` under `limit` and the context, whichever ends first.
    async fn guarded<T, F>(&self, step: Step, limit: Duration, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        if let Some(interrupt) = self.ctx.interrupt() {
            return Err(interrupted(step, interrupt));
        }

        let limit = match self.ctx.remaining() {
            Some(remaining) => limit.min(remaining),
            None => limit,
        };

        tokio::select! {
            biased;
            interrupt = self.ctx.done() => Err(interrupted(step, interrupt)),
            result = tokio::time::timeout(limit, fut) => {
                result.map_err(|_| ClientError::Timeout { step })?
            }
        }
    }

    fn transition(&mut self, next: TransactionState) {
        tracing::trace!("Transaction {} -> {}", self.state, next);
        self.state = next;
    }

    fn finish<T>(&mut self, result: &Result<T, ClientError>) {
        match result {
            Ok(_) => self.transition(TransactionState::Success),
            Err(e) => {
                tracing::debug!("Transaction failed: {}", e);
                self.transition(TransactionState::Failed(e.step()));
            }
        }
    }
}

fn interrupted(step: Step, interrupt: Interrupt) -> ClientError {
    match interrupt {
        Interrupt::DeadlineExceeded => ClientError::Timeout { step },
        Interrupt::Cancelled => ClientError::Cancelled { step },
    }
}

/// Timeouts and cancellations cut a write off at an unknown point.
fn is_interrupt(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::Timeout { .. } | ClientError::Cancelled { .. }
    )
}

/// Runs a read transaction against `pool`.
pub async fn read<P: ConnectionPool>(
    pool: &P,
    config: TransactionConfig,
    ctx: &Context,
    subscribe: &[u8],
    unsubscribe: &[u8],
) -> Result<Bytes, ClientError> {
    Transaction::new(pool, config, ctx)
        .read(subscribe, unsubscribe)
        .await
}

/// Runs a write transaction against `pool`.
pub async fn write<P: ConnectionPool>(
    pool: &P,
    config: TransactionConfig,
    ctx: &Context,
    command: &[u8],
) -> Result<(), ClientError> {
    Transaction::new(pool, config, ctx).write(command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPool, MockRead, MockWrite, RefusingPool};
    use london_protocol::{ProtocolError, STX};
    use std::io;
    use tokio::time::Instant;

    const SUBSCRIBE: &[u8] = &[STX, 0x8E, 0x00, 0x00, ETX];
    const UNSUBSCRIBE: &[u8] = &[STX, 0x8F, 0x00, 0x00, ETX];

    fn fast() -> TransactionConfig {
        TransactionConfig::default()
            .with_overall_timeout(Duration::from_millis(500))
            .with_write_timeout(Duration::from_millis(100))
            .with_read_timeout(Duration::from_millis(100))
    }

    fn status_frame(payload: &[u8]) -> Vec<u8> {
        Frame::new(payload.to_vec()).encode().unwrap().to_vec()
    }

    #[test]
    fn test_config_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.overall_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let config = TransactionConfig::default().with_read_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));

        let config = TransactionConfig::default().with_write_timeout(Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            TransactionState::Writing(Step::Subscribe).to_string(),
            "writing (write subscribe command)"
        );
        assert_eq!(TransactionState::Failed(None).to_string(), "failed");
    }

    #[tokio::test]
    async fn test_read_success() {
        let pool = MockPool::new();
        let payload = [0x88, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x0A, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
        pool.push_frame(status_frame(&payload));

        let result = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap();

        assert_eq!(&result[..], &payload[..]);
        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec(), UNSUBSCRIBE.to_vec()]);
        assert_eq!(pool.acquires(), 1);
        assert_eq!(pool.releases(), vec![true]);
    }

    #[tokio::test]
    async fn test_read_timeout_releases_once() {
        let pool = MockPool::new();
        pool.push_read(MockRead::Hang);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Response }));
        // Subscribe, then the best-effort unsubscribe
        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec(), UNSUBSCRIBE.to_vec()]);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let pool = MockPool::new();
        pool.push_read(MockRead::Hang);

        let (ctx, token) = Context::background().with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let config = fast().with_read_timeout(Duration::from_millis(400));
        let err = read(&pool, config, &ctx, SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled { step: Step::Response }));
        assert_eq!(pool.written().len(), 2);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_cancel_after_status_still_unsubscribes() {
        let pool = MockPool::new();
        let (ctx, token) = Context::background().with_cancel();
        pool.push_read(MockRead::CancelThen(token, status_frame(&[0x01])));

        let err = read(&pool, fast(), &ctx, SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled { step: Step::Unsubscribe }));
        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec(), UNSUBSCRIBE.to_vec()]);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_interrupted_subscribe_unsubscribes() {
        let pool = MockPool::new();
        pool.push_write(MockWrite::Hang);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Subscribe }));
        assert_eq!(pool.written(), vec![UNSUBSCRIBE.to_vec()]);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_skips_unsubscribe() {
        let pool = MockPool::new();
        pool.push_write(MockWrite::Fail(io::ErrorKind::ConnectionReset));

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Io { step: Step::Subscribe, .. }));
        assert!(pool.written().is_empty());
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_hung_unsubscribe_keeps_read_timeout() {
        let pool = MockPool::new();
        pool.push_write(MockWrite::Accept);
        pool.push_write(MockWrite::Hang);
        pool.push_read(MockRead::Hang);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Response }));
        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec()]);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_keeps_cancellation() {
        let pool = MockPool::new();
        pool.push_write(MockWrite::Accept);
        pool.push_write(MockWrite::Fail(io::ErrorKind::BrokenPipe));
        pool.push_read(MockRead::Hang);

        let (ctx, token) = Context::background().with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let config = fast().with_read_timeout(Duration::from_millis(400));
        let err = read(&pool, config, &ctx, SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled { step: Step::Response }));
        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec()]);
        assert_eq!(pool.acquires(), 1);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_precancelled_context_never_acquires() {
        let pool = MockPool::new();
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();

        let err = read(&pool, fast(), &ctx, SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled { step: Step::Acquire }));
        assert_eq!(pool.acquires(), 0);
        assert!(pool.releases().is_empty());
    }

    #[tokio::test]
    async fn test_overall_deadline_bounds_read() {
        let pool = MockPool::new();
        pool.push_read(MockRead::Hang);

        let config = TransactionConfig::default()
            .with_overall_timeout(Duration::from_millis(80))
            .with_read_timeout(Duration::from_secs(3));

        let start = Instant::now();
        let err = read(&pool, config, &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Response }));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = MockPool::new();
        pool.state.lock().acquire_delay = Some(Duration::from_millis(500));

        let config = fast().with_overall_timeout(Duration::from_millis(50));
        let err = read(&pool, config, &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Acquire }));
        assert!(pool.written().is_empty());
        assert!(pool.releases().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_failure() {
        let err = write(&RefusingPool, fast(), &Context::background(), SUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Io { step: Step::Acquire, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_short_write() {
        let pool = MockPool::new();
        pool.state.lock().max_write = Some(3);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        match err {
            ClientError::ShortWrite {
                step,
                written,
                expected,
            } => {
                assert_eq!(step, Step::Subscribe);
                assert_eq!(written, 3);
                assert_eq!(expected, SUBSCRIBE.len());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_malformed_response_released_unhealthy() {
        let pool = MockPool::new();
        pool.push_frame(vec![0x41, 0x42, ETX]);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::MalformedFrame(_))
        ));
        assert_eq!(pool.written().len(), 2);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let pool = MockPool::new();
        pool.push_frame(vec![STX, 0x01, 0x02, 0xFF, ETX]);

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::ChecksumMismatch {
                expected: 0x03,
                actual: 0xFF
            })
        ));
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_read_io_error() {
        let pool = MockPool::new();
        pool.push_read(MockRead::Fail(io::ErrorKind::ConnectionReset));

        let err = read(&pool, fast(), &Context::background(), SUBSCRIBE, UNSUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Io { step: Step::Response, .. }));
        assert_eq!(pool.written().len(), 2);
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_write_success() {
        let pool = MockPool::new();

        write(&pool, fast(), &Context::background(), SUBSCRIBE)
            .await
            .unwrap();

        assert_eq!(pool.written(), vec![SUBSCRIBE.to_vec()]);
        assert_eq!(pool.releases(), vec![true]);
    }

    #[tokio::test]
    async fn test_write_timeout() {
        let pool = MockPool::new();
        pool.state.lock().hang_writes = true;

        let err = write(&pool, fast(), &Context::background(), SUBSCRIBE)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout { step: Step::Command }));
        assert_eq!(pool.releases(), vec![false]);
    }

    #[tokio::test]
    async fn test_transaction_state() {
        let pool = MockPool::new();
        let tx = Transaction::new(&pool, fast(), &Context::background());
        assert_eq!(tx.state(), TransactionState::Idle);

        let mut tx = tx;
        let result = tx.run_write(SUBSCRIBE).await;
        tx.finish(&result);
        assert_eq!(tx.state(), TransactionState::Success);
    }
}
