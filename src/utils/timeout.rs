//! Timeout helpers and a one-shot rendezvous for request/response waits.
//!
//! A caller that must block until a deferred phase reports back (a login
//! confirmation, a logout acknowledgement) creates a [`pending`] pair, hands the
//! [`Completer`] to the handler side and waits on the [`Pending`] with a deadline.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default timeout for handshakes and request/response waits
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between latency probes
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Grace period for flushing a closing stream
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `future`, mapping an elapsed deadline to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Resolving half of a rendezvous
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Deliver the value. Returns it back if the waiter already gave up.
    pub fn complete(self, value: T) -> std::result::Result<(), T> {
        self.tx.send(value)
    }
}

/// Waiting half of a rendezvous
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Wait for the value. Fails with `Timeout`, or `ConnectionClosed` when the
    /// completer was dropped unresolved.
    pub async fn wait(self, timeout: Duration) -> Result<T> {
        with_timeout_error(
            async { self.rx.await.map_err(|_| ProtocolError::ConnectionClosed) },
            timeout,
        )
        .await
    }
}

pub fn pending<T>() -> (Completer<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Pending { rx })
}

/// Doubling delay between retries of a failing operation, capped at `max`
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call returns twice as much
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let (completer, waiter) = pending();
        tokio::spawn(async move {
            completer.complete("logged in").unwrap();
        });
        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), "logged in");
    }

    #[tokio::test]
    async fn times_out_without_answer() {
        let (_completer, waiter) = pending::<u32>();
        assert!(matches!(
            waiter.wait(Duration::from_millis(20)).await,
            Err(ProtocolError::Timeout)
        ));
    }

    #[tokio::test]
    async fn dropped_completer_reports_closed() {
        let (completer, waiter) = pending::<u32>();
        drop(completer);
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(35));
        assert_eq!(backoff.next_delay(), Duration::from_millis(35));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
