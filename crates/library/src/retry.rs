//! Bounded retries with exponential backoff for repository transfers.

use std::time::Duration;

/// Attempts per archive transfer.
pub const FETCH_ATTEMPTS: usize = 3;
/// First backoff delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Timeout for one small-object request (header, dependency table).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for one archive transfer.
pub const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Run `op` up to `attempts` times, sleeping `base * 2^n` (capped) between
/// retryable failures. Non-retryable errors surface immediately.
pub(crate) async fn with_retries<T, F, Fut>(attempts: usize, op: F) -> audb_storage::error::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = audb_storage::error::Result<T>>,
{
    let mut delay = BACKOFF_BASE;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && err.is_retryable() => {
                attempt += 1;
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transfer");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audb_storage::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(3, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(exn::Exn::from(ErrorKind::Network("flaky".to_string()))),
                _ => Ok(42),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_error() {
        let calls = AtomicUsize::new(0);
        let result: audb_storage::error::Result<()> = with_retries(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(exn::Exn::from(ErrorKind::Network("down".to_string())))
        })
        .await;
        assert!(matches!(&*result.unwrap_err(), ErrorKind::Network(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicUsize::new(0);
        let result: audb_storage::error::Result<()> = with_retries(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(exn::Exn::from(ErrorKind::NotFound("gone".to_string())))
        })
        .await;
        assert!(matches!(&*result.unwrap_err(), ErrorKind::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
