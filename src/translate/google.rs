use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::provider::{status_error, TranslateError, TranslationProvider};

/// Base language codes accepted as targets.
const LANGUAGES: &[&str] = &[
    "af", "am", "ar", "az", "be", "bg", "bn", "bs", "ca", "ceb", "co", "cs", "cy", "da", "de",
    "el", "en", "eo", "es", "et", "eu", "fa", "fi", "fr", "fy", "ga", "gd", "gl", "gu", "ha",
    "haw", "he", "hi", "hmn", "hr", "ht", "hu", "hy", "id", "ig", "is", "it", "ja", "jv", "ka",
    "kk", "km", "kn", "ko", "ku", "ky", "la", "lb", "lo", "lt", "lv", "mg", "mi", "mk", "ml",
    "mn", "mr", "ms", "mt", "my", "ne", "nl", "no", "ny", "or", "pa", "pl", "ps", "pt", "ro",
    "ru", "rw", "sd", "si", "sk", "sl", "sm", "sn", "so", "sq", "sr", "st", "su", "sv", "sw",
    "ta", "te", "tg", "th", "tk", "tl", "tr", "tt", "ug", "uk", "ur", "uz", "vi", "xh", "yi",
    "yo", "zh", "zu",
];

/// Google Cloud Translation v2 (API key auth).
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    format: &'static str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Deserialize)]
struct TranslateData {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Translation {
    translated_text: String,
}

impl GoogleProvider {
    pub const DEFAULT_BASE: &'static str = "https://translation.googleapis.com";

    pub fn new(client: reqwest::Client, api_key: SecretString, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Google wants `zh-CN`/`zh-TW` for Chinese and lowercase otherwise.
    fn normalize(lang: &str) -> String {
        match lang.to_lowercase().as_str() {
            "zh-cn" | "zh-hans" => "zh-CN".to_string(),
            "zh-tw" | "zh-hant" => "zh-TW".to_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl TranslationProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn supports_language(&self, lang: &str) -> bool {
        let lang = lang.to_lowercase();
        let base = lang.split('-').next().unwrap_or_default();
        LANGUAGES.contains(&base)
    }

    async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<String, TranslateError> {
        if !self.supports_language(target) {
            return Err(TranslateError::UnsupportedLanguage(target.to_string()));
        }

        let body = TranslateRequest {
            q: text,
            target: Self::normalize(target),
            source: source.map(Self::normalize),
            format: "text",
        };

        let mut url = url::Url::parse(&format!("{}/language/translate/v2", self.base_url))
            .map_err(|e| TranslateError::Transient(format!("Invalid endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == StatusCode::FORBIDDEN && text.contains("LimitExceeded") {
                return Err(TranslateError::QuotaExceeded);
            }
            return Err(status_error(status, &text, None));
        }

        let parsed: TranslateResponse = response.json().await?;
        parsed
            .data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| TranslateError::Transient("Google returned no translations".into()))
    }
}
