//! Deadlines and cancellation for DSP operations.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    DeadlineExceeded,
    Cancelled,
}

/// Carries an optional deadline and a cancellation signal into an operation.
///
/// Derived contexts keep the earlier of the two deadlines and are cancelled
/// whenever their parent is.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Returns a derived context and the token that cancels it.
    pub fn with_cancel(self) -> (Self, CancellationToken) {
        let token = self.token.child_token();
        let ctx = Self {
            deadline: self.deadline,
            token: token.clone(),
        };
        (ctx, token)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, or `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the reason this context is finished, if it is.
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interrupt::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the deadline passes or the context is cancelled.
    pub async fn done(&self) -> Interrupt {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interrupt::Cancelled,
            _ = deadline => Interrupt::DeadlineExceeded,
        }
    }
}
