//! Bounded, cancellable polling for asynchronous provider operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Minimum time between "still waiting" log lines.
    pub log_every: Duration,
}

impl PollSettings {
    pub const fn new(interval_secs: u64, max_wait_secs: u64, log_every_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            max_wait: Duration::from_secs(max_wait_secs),
            log_every: Duration::from_secs(log_every_secs),
        }
    }
}

/// Result of one probe.
pub enum Poll<T> {
    Ready(T),
    /// Not there yet; carries the observed status for logging.
    Pending(String),
}

/// Probe until ready, the deadline passes, or `cancel` fires.
///
/// The probe runs immediately and then once per interval. Errors from the
/// probe end the wait.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, StageError>>,
{
    let started = Instant::now();
    let mut last_log = started;

    loop {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled(format!("waiting for {what}")));
        }

        let status = match probe().await? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending(status) => status,
        };

        let waited = started.elapsed();
        if waited >= settings.max_wait {
            tracing::warn!(what, %status, waited_secs = waited.as_secs(), "gave up waiting");
            return Err(StageError::ValidationTimeout {
                what: what.to_string(),
                waited,
            });
        }
        if last_log.elapsed() >= settings.log_every {
            tracing::info!(what, %status, waited_secs = waited.as_secs(), "still waiting");
            last_log = Instant::now();
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            _ = cancel.cancelled() => {
                return Err(StageError::Cancelled(format!("waiting for {what}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const FAST: PollSettings = PollSettings::new(30, 1800, 120);

    #[tokio::test(start_paused = true)]
    async fn returns_once_probe_is_ready() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let value = poll_until("thing", &FAST, &CancellationToken::new(), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= 3 {
                Poll::Ready(n)
            } else {
                Poll::Pending("creating".into())
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_max_wait() {
        let started = Instant::now();
        let err = poll_until::<(), _, _>("db", &FAST, &CancellationToken::new(), || async {
            Ok(Poll::Pending("creating".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::ValidationTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = poll_until::<(), _, _>("cert", &FAST, &cancel, || async {
            Ok(Poll::Pending("pending".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::Cancelled(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_end_the_wait() {
        let err = poll_until::<(), _, _>("cert", &FAST, &CancellationToken::new(), || async {
            Err(StageError::CertificateFailed("arn:x".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::CertificateFailed(_)));
    }
}
