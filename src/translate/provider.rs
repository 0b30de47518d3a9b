use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::SecretString;
use std::sync::Arc;
use thiserror::Error;

use super::{DeeplProvider, GoogleProvider, OpenAiProvider};
use crate::config::{ProviderKind, TranslationConfig};

/// Classified provider failure.
///
/// `Clone` because one failed provider call is handed to every caller that
/// was coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    /// Account quota or character allowance used up
    #[error("Translation quota exceeded")]
    QuotaExceeded,
    /// The provider cannot translate into this language
    #[error("Unsupported target language: {0}")]
    UnsupportedLanguage(String),
    /// Anything that may succeed on a later attempt
    #[error("Translation failed: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for TranslateError {
    fn from(err: reqwest::Error) -> Self {
        // Some providers take the API key as a query parameter.
        TranslateError::Transient(err.without_url().to_string())
    }
}

/// A machine translation backend.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Short identifier used in logs (`deepl`, `openai`, `google`).
    fn name(&self) -> &str;

    /// Whether `lang` can be used as a target at all.
    fn supports_language(&self, lang: &str) -> bool;

    /// Translate `text` into `target`. `source` is auto-detected when `None`.
    async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<String, TranslateError>;
}

/// Build the provider selected by `config`.
///
/// Fails when no API key is configured or a custom endpoint is not HTTPS.
pub fn provider_from_config(
    config: &TranslationConfig,
) -> anyhow::Result<Arc<dyn TranslationProvider>> {
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from)
        .context("translation.api_key is not set")?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("feedrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build translation HTTP client")?;

    let custom = config.api_url.as_deref();
    let provider: Arc<dyn TranslationProvider> = match config.provider {
        ProviderKind::Deepl => {
            let base = endpoint(custom, DeeplProvider::default_base(&api_key))?;
            Arc::new(DeeplProvider::new(client, api_key, base))
        }
        ProviderKind::Openai => {
            let base = endpoint(custom, OpenAiProvider::DEFAULT_BASE)?;
            Arc::new(OpenAiProvider::new(client, api_key, base, config.model.clone()))
        }
        ProviderKind::Google => {
            let base = endpoint(custom, GoogleProvider::DEFAULT_BASE)?;
            Arc::new(GoogleProvider::new(client, api_key, base))
        }
    };

    tracing::info!(provider = provider.name(), "Translation provider configured");
    Ok(provider)
}

/// Resolve the base URL, refusing plain HTTP except on localhost so keys
/// are never sent in clear text.
fn endpoint(custom: Option<&str>, default: &str) -> anyhow::Result<String> {
    let base = custom.unwrap_or(default).trim_end_matches('/');
    if !base.starts_with("https://") {
        let is_localhost =
            base.starts_with("http://127.0.0.1") || base.starts_with("http://localhost");
        anyhow::ensure!(
            is_localhost,
            "translation.api_url must use HTTPS (got {base})"
        );
        tracing::warn!(api_url = %base, "Using non-HTTPS translation endpoint (localhost only)");
    }
    Ok(base.to_string())
}

/// Shared mapping of a failed HTTP response.
///
/// `quota_status` is the provider's dedicated quota code, if any.
pub(crate) fn status_error(
    status: StatusCode,
    body: &str,
    quota_status: Option<u16>,
) -> TranslateError {
    if quota_status == Some(status.as_u16()) || body.contains("insufficient_quota") {
        return TranslateError::QuotaExceeded;
    }
    let snippet: String = body.chars().take(200).collect();
    TranslateError::Transient(format!("HTTP {}: {}", status.as_u16(), snippet.trim()))
}
