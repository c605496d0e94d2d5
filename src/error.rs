//! Error types for the Turnstile admission layer.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitRejection;

/// Main error type for Turnstile operations.
///
/// Only [`TurnstileError::LimitExceeded`] is meant to reach an HTTP client.
/// Store faults are absorbed by the limiter (fail open) and the cache (fail
/// soft); configuration errors are fatal before traffic is served.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The caller exceeded its rate limit
    #[error("Rate limit exceeded: retry after {}s", .0.retry_after)]
    LimitExceeded(RateLimitRejection),

    /// The backing counter/cache store failed
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store operation did not finish within the operation timeout
    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cached value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error is an infrastructure fault of the backing store.
    pub fn is_store_fault(&self) -> bool {
        matches!(
            self,
            TurnstileError::StoreUnavailable(_) | TurnstileError::StoreTimeout(_)
        )
    }

    /// HTTP status code a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            TurnstileError::LimitExceeded(_) => 429,
            _ => 500,
        }
    }
}

impl From<redis::RedisError> for TurnstileError {
    fn from(e: redis::RedisError) -> Self {
        TurnstileError::StoreUnavailable(e.to_string())
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(e: config::ConfigError) -> Self {
        TurnstileError::Config(e.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Run a store operation under a deadline, mapping elapsed time to
/// [`TurnstileError::StoreTimeout`].
pub(crate) async fn within<T, F>(limit: Duration, op: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(TurnstileError::StoreTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_fault_classification() {
        assert!(TurnstileError::StoreUnavailable("down".into()).is_store_fault());
        assert!(TurnstileError::StoreTimeout(Duration::from_millis(250)).is_store_fault());
        assert!(!TurnstileError::Config("bad".into()).is_store_fault());
    }

    #[test]
    fn test_limit_exceeded_maps_to_429() {
        let err = TurnstileError::LimitExceeded(RateLimitRejection {
            retry_after: 30,
            limit: 5,
            window_ms: 60_000,
            remaining: 0,
        });
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_string(), "Rate limit exceeded: retry after 30s");
        assert_eq!(TurnstileError::Config("x".into()).status_code(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out_slow_operation() {
        let result: Result<()> = within(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(TurnstileError::StoreTimeout(_))));
    }
}
