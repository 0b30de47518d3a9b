use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_feed, ParsedFeed, RawItem};
use crate::config::FetcherConfig;
use crate::storage::{Database, FailureRecord, Feed, Validators};
use crate::util::{now_unix, validate_url, UrlValidationError};

/// Errors that can occur while fetching one feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status other than 200 or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Document could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Feed URL refused before any request was made
    #[error("Feed URL rejected: {0}")]
    InvalidUrl(#[from] UrlValidationError),
}

impl FetchError {
    /// 410 Gone and refused URLs will not fix themselves; everything else might.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::HttpStatus(410) | FetchError::InvalidUrl(_) => FailureKind::Terminal,
            _ => FailureKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Back off and try again later
    Transient,
    /// Deactivate the feed now
    Terminal,
}

#[derive(Debug)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub error: FetchError,
}

impl From<FetchError> for FetchFailure {
    fn from(error: FetchError) -> Self {
        Self {
            kind: error.kind(),
            error,
        }
    }
}

/// A modified document and the metadata that came with it
#[derive(Debug, Clone, Default)]
pub struct FetchedDocument {
    pub items: Vec<RawItem>,
    pub validators: Validators,
    pub title: Option<String>,
    pub site_url: Option<String>,
}

/// Classified result of one conditional fetch. Never an `Err`.
#[derive(Debug)]
pub enum FetchOutcome {
    /// HTTP 304: the stored validators still describe the document
    NotModified,
    Modified(FetchedDocument),
    Failed(FetchFailure),
}

impl FetchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// Delay before a feed with `failures` consecutive failures is tried again:
/// `base * 2^min(failures, cap_exponent)`, capped at `max`.
pub fn backoff_delay(failures: i64, config: &FetcherConfig) -> Duration {
    let exponent = failures.clamp(0, i64::from(config.backoff_cap_exponent)) as u32;
    let delay = config
        .backoff_base_secs
        .saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_secs(delay.min(config.backoff_max_secs))
}

/// Conditional HTTP fetcher with per-feed health bookkeeping.
///
/// [`Fetcher::fetch`] only classifies; [`Fetcher::record`] persists the
/// outcome. The feed cycle calls `record` for a modified document only after
/// its entries are stored, so new validators never hide unsaved items
/// behind a 304.
#[derive(Clone)]
pub struct Fetcher {
    db: Database,
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(db: Database, config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(db, client, config))
    }

    pub fn with_client(db: Database, client: reqwest::Client, config: FetcherConfig) -> Self {
        Self { db, client, config }
    }

    /// Fetch `feed` using its stored validators.
    pub async fn fetch(&self, feed: &Feed) -> FetchOutcome {
        match self.fetch_inner(feed).await {
            Ok(Some(doc)) => FetchOutcome::Modified(doc),
            Ok(None) => {
                tracing::debug!(feed_id = feed.id, "Feed not modified");
                FetchOutcome::NotModified
            }
            Err(error) => FetchOutcome::Failed(error.into()),
        }
    }

    async fn fetch_inner(&self, feed: &Feed) -> Result<Option<FetchedDocument>, FetchError> {
        let url = validate_url(&feed.url, self.config.allow_private_networks)?;
        let validators = feed.validators();
        let mut retry_count = 0;

        let (bytes, headers) = loop {
            let attempt = tokio::time::timeout(
                self.config.timeout(),
                self.attempt(url.as_str(), &validators),
            )
            .await
            .map_err(|_| FetchError::Timeout)
            .and_then(|r| r);

            let retryable = match &attempt {
                Ok(Some(_)) | Ok(None) => false,
                Err(FetchError::HttpStatus(status)) => {
                    *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
                }
                Err(FetchError::IncompleteResponse { .. }) => true,
                Err(_) => false,
            };

            if retryable && retry_count < self.config.request_retries {
                let delay_secs = 2u64.pow(retry_count); // 1s, 2s, 4s
                if let Err(e) = &attempt {
                    tracing::warn!(
                        feed_id = feed.id,
                        error = %e,
                        retry = retry_count,
                        delay_secs = delay_secs,
                        "Fetch failed, retrying after delay"
                    );
                }
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                retry_count += 1;
                continue;
            }

            match attempt? {
                Some(body) => break body,
                None => return Ok(None),
            }
        };

        let ParsedFeed {
            title,
            site_url,
            items,
        } = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        Ok(Some(FetchedDocument {
            items,
            validators: validators_from(&headers),
            title,
            site_url,
        }))
    }

    /// One GET. `Ok(None)` is a 304.
    async fn attempt(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<Option<(Vec<u8>, HeaderMap)>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let headers = response.headers().clone();
        let bytes = read_limited_bytes(response, self.config.max_body_bytes).await?;
        Ok(Some((bytes, headers)))
    }

    /// Persist the health effect of `outcome` for `feed`.
    ///
    /// Success (modified or not) resets the failure count. A failure bumps it,
    /// pushes `backoff_until` out, and deactivates the feed when the failure
    /// is terminal or the count reaches `max_failures`.
    pub async fn record(&self, feed: &Feed, outcome: &FetchOutcome) -> anyhow::Result<()> {
        let now = now_unix();
        match outcome {
            FetchOutcome::NotModified => {
                self.db
                    .record_fetch_success(feed.id, now, None, None, None)
                    .await
            }
            FetchOutcome::Modified(doc) => {
                self.db
                    .record_fetch_success(
                        feed.id,
                        now,
                        Some(&doc.validators),
                        doc.title.as_deref(),
                        doc.site_url.as_deref(),
                    )
                    .await
            }
            FetchOutcome::Failed(failure) => {
                let failures = self.db.increment_feed_failures(feed.id).await?;
                let record = self.failure_record(failures, failure.kind, now);
                self.db
                    .record_fetch_failure(feed.id, &record, &failure.error.to_string())
                    .await?;

                if record.deactivate {
                    tracing::info!(
                        feed_id = feed.id,
                        url = %feed.url,
                        failures = failures,
                        error = %failure.error,
                        "Feed deactivated"
                    );
                } else {
                    tracing::warn!(
                        feed_id = feed.id,
                        url = %feed.url,
                        failures = failures,
                        retry_at = record.backoff_until,
                        error = %failure.error,
                        "Feed fetch failed, backing off"
                    );
                }
                Ok(())
            }
        }
    }

    /// Backoff and deactivation decision after the `failures`-th consecutive failure.
    pub fn failure_record(&self, failures: i64, kind: FailureKind, now: i64) -> FailureRecord {
        let delay = backoff_delay(failures, &self.config);
        FailureRecord {
            attempted_at: now,
            backoff_until: now.saturating_add(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX)),
            deactivate: kind == FailureKind::Terminal || failures >= self.config.max_failures,
        }
    }
}

fn validators_from(headers: &HeaderMap) -> Validators {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    Validators {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
