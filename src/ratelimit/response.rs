//! HTTP-facing rate limit metadata: response headers and the 429 body.
//!
//! The transport layer is external; it copies [`RateLimitHeaders`] onto every
//! limited response and serializes [`RejectionBody`] when a request is denied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Limit of the policy applied to the request.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Requests left in the current window.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Unix timestamp (seconds) at which the window resets.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Seconds to wait before retrying; only sent on rejection.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Error type tag carried in the rejection body.
pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_ERROR";

/// HTTP status of a rejection.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Why a request was rejected; the `context` object of the 429 body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRejection {
    /// Seconds until the identity may retry
    pub retry_after: u64,
    /// Configured limit
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests left (always 0 on rejection)
    pub remaining: u64,
}

impl RateLimitRejection {
    /// Human readable message for the body.
    pub fn message(&self) -> String {
        format!(
            "Too many requests, please try again in {} seconds",
            self.retry_after
        )
    }

    /// Build the full 429 body.
    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            error: RejectionError {
                message: self.message(),
                kind: RATE_LIMIT_ERROR.to_string(),
                context: self.clone(),
            },
        }
    }
}

/// `{ "error": { "message", "type", "context" } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    /// Error envelope
    pub error: RejectionError,
}

/// Error envelope of the rejection body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionError {
    /// Human readable message
    pub message: String,
    /// Always [`RATE_LIMIT_ERROR`]
    #[serde(rename = "type")]
    pub kind: String,
    /// Machine readable details
    pub context: RateLimitRejection,
}

impl RejectionBody {
    /// Serialize to the JSON sent with a 429.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Header set for one rate limit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Configured limit
    pub limit: u64,
    /// Requests left in the window
    pub remaining: u64,
    /// Window reset time
    pub reset_at: DateTime<Utc>,
    /// Present only when the request was denied
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name/value pairs, in a stable order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}
