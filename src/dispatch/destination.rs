use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use super::message::ComposedMessage;

/// Classified failure of one send attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Rate limited, network trouble or a server error; try again later
    #[error("Send failed: {reason}")]
    Retryable {
        reason: String,
        /// Server-requested wait, when it gave one
        retry_after: Option<Duration>,
    },
    /// This one message was refused; the destination itself is fine
    #[error("Message rejected: {0}")]
    Rejected(String),
    /// The destination is gone or refuses us; stop sending to it
    #[error("Destination unavailable: {0}")]
    Terminal(String),
}

impl SendError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        SendError::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        // Bot tokens live in some request URLs.
        SendError::retryable(err.without_url().to_string())
    }
}

/// One delivery platform (Telegram, Discord, webhooks).
///
/// `channel_id` is the subscription's platform-specific target: a chat id,
/// a channel snowflake or a webhook URL.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Matches `Subscription::platform`.
    fn platform(&self) -> &str;

    async fn send(&self, channel_id: &str, message: &ComposedMessage) -> Result<(), SendError>;
}

/// Default mapping of a non-success HTTP status.
///
/// 408, 429 and 5xx are worth retrying; 401, 403, 404 and 410 mean the
/// target is gone or we lost access; any other status rejects the message.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, detail: &str) -> SendError {
    let reason = if detail.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), detail)
    };

    match status.as_u16() {
        408 | 429 => SendError::Retryable {
            reason,
            retry_after: retry_after_header(headers),
        },
        s if s >= 500 => SendError::Retryable {
            reason,
            retry_after: retry_after_header(headers),
        },
        401 | 403 | 404 | 410 => SendError::Terminal(reason),
        _ => SendError::Rejected(reason),
    }
}

/// `Retry-After` in delta-seconds form.
pub fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    retry_after_secs(secs)
}

/// A server-supplied wait in seconds. Negative, non-finite and
/// unrepresentable values are ignored.
pub fn retry_after_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
