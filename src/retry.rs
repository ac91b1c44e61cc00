//! Retry classification and backoff scheduling
//!
//! The upload pipeline owns its attempt loop (it has to emit per-attempt
//! progress events and observe cancellation between attempts); this module
//! supplies the pieces it is built from:
//! - [`IsRetryable`] classifies transient failures
//! - [`Backoff`] yields exponentially growing, optionally jittered delays
//! - [`sleep_or_cancel`] waits out a delay unless the operation is cancelled

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection resets, server busy) should return `true`.
/// Permanent failures (missing file, rejected request, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Timeouts are expected on multi-hundred-MB bodies and must be retried
            Error::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Rate limiting and server-side failures clear up on their own
            Error::Telegram { code, .. } => *code == 429 || *code >= 500,
            Error::Transmission(_) => true,
            Error::Cancelled { .. } => false,
            Error::Config { .. } => false,
            Error::InvalidSource(_) => false,
            Error::Fetch(_) => false,
            Error::Conflict { .. } => false,
            Error::Transfer { .. } => false,
            Error::NotFound(_) => false,
            Error::Serialization(_) => false,
            Error::Server(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Exponential backoff schedule derived from a [`RetryConfig`]
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a schedule at the configured initial delay
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay,
            max: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.multiplier);
        self.next = grown.min(self.max);

        if self.jitter {
            add_jitter(base).min(self.max)
        } else {
            base
        }
    }
}

/// Wait for `delay`, returning `false` early if `cancel` fires first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Add random jitter to a delay to prevent hammering a struggling endpoint
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    fn config(jitter: bool) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(&config(false));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        for _ in 0..50 {
            let mut backoff = Backoff::new(&config(true));
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100), "got {delay:?}");
            assert!(delay <= Duration::from_millis(200), "got {delay:?}");
        }
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::Transmission("reset".into()).is_retryable());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_retryable()
        );
        assert!(
            Error::Telegram {
                code: 502,
                description: "Bad Gateway".into(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            Error::Telegram {
                code: 429,
                description: "Too Many Requests".into(),
                retry_after: Some(3)
            }
            .is_retryable()
        );
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(
            !Error::Cancelled {
                kind: OperationKind::Uploading
            }
            .is_retryable()
        );
        assert!(
            !Error::Telegram {
                code: 400,
                description: "Bad Request: chat not found".into(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            !Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).is_retryable()
        );
    }

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(10), &token).await);
    }

    #[tokio::test]
    async fn sleep_returns_early_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let start = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(10), &token).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
