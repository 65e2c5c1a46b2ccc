//! Per-operation deadline and cancellation carried into every storage call.

use crate::log_store::{StorageError, StorageResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation scope for one storage operation.
///
/// Cloning shares the cancellation token, so cancelling any clone cancels all
/// of them. A context without a deadline never times out on its own.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Context with no deadline and a fresh cancellation token
    pub fn background() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancellation: CancellationToken::new(),
        }
    }

    /// Derive a context whose cancellation follows `parent`
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancellation: parent.child_token(),
        }
    }

    /// Tighten the deadline; a later deadline than the current one is ignored
    pub fn tighten(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(current) if current <= candidate => current,
            _ => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drive `fut` to completion unless the deadline passes or the context is
    /// cancelled first. The future is dropped in either case, which for a
    /// database transaction means rollback.
    pub async fn run<F, T>(&self, operation: &'static str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled(operation));
        }
        // timeout_at polls the future before checking the deadline
        if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
            return Err(StorageError::Timeout(operation));
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| StorageError::Timeout(operation))?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(StorageError::Cancelled(operation)),
            result = bounded => result,
        }
    }
}

/// Parse a `grpc-timeout` header value (`<digits><unit>`, unit one of
/// `H M S m u n`) into a duration.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        "M" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}
