//! Error taxonomy for network-facing operations.
//!
//! Failures fall into two classes that drive retry behavior:
//! - **transient** — timeouts, connection errors, 5xx, rate limiting;
//!   retried with exponential backoff, bounded attempts.
//! - **permanent** — 401/403/404 and malformed payloads; surfaced
//!   immediately.
//!
//! Per-item failures (one document, one chunk) are counted and skipped by
//! the caller; they never abort a batch. The retry loop itself lives in
//! [`with_backoff`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Maximum attempts for a transient failure (initial call + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay before the first retry; doubles per attempt.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    /// Retryable: the operation may succeed if repeated.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-requested delay (`Retry-After`), when present.
        retry_after: Option<Duration>,
    },

    /// Non-retryable: auth failures, missing resources, bad payloads.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Query vectorization was unavailable; search returns empty-with-error.
    #[error("vectorization failed: {0}")]
    Vectorization(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Classify an HTTP status into the taxonomy.
///
/// 429 and 5xx are transient; every other non-success status is permanent
/// (401/403/404 included).
pub fn classify_status(status: reqwest::StatusCode, body_preview: &str) -> EngineError {
    if status.as_u16() == 429 || status.is_server_error() {
        EngineError::transient(format!("HTTP {status}: {body_preview}"))
    } else {
        EngineError::Permanent(format!("HTTP {status}: {body_preview}"))
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, sleeping between attempts.
///
/// Delays double per attempt (1s, 2s) unless the error carries a
/// `Retry-After` hint, which takes precedence. Permanent errors abort
/// immediately; the last transient error is returned once attempts are
/// exhausted.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut last_err = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = match &last_err {
                Some(EngineError::Transient {
                    retry_after: Some(hint),
                    ..
                }) => *hint,
                _ => BASE_DELAY * 2u32.pow(attempt - 1),
            };
            tracing::warn!(target: "context_engine::retry", %label, attempt, ?delay, "retrying");
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::transient(format!("{label}: retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_status_classification() {
        let transient = classify_status(reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(transient.is_retryable());

        let limited = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(limited.is_retryable());

        for status in [
            reqwest::StatusCode::UNAUTHORIZED,
            reqwest::StatusCode::FORBIDDEN,
            reqwest::StatusCode::NOT_FOUND,
        ] {
            assert!(!classify_status(status, "").is_retryable());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_transient() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::transient("boom"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_permanent_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Permanent("denied".into())) }
        })
        .await;
        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::transient("still down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
