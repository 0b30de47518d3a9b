use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::provider::{status_error, TranslateError, TranslationProvider};

/// DeepL answers 456 when the character allowance is used up.
const QUOTA_EXCEEDED: u16 = 456;

/// Target codes DeepL accepts, keyed by the lowercase code users type.
const LANGUAGES: &[(&str, &str)] = &[
    ("bg", "BG"),
    ("cs", "CS"),
    ("da", "DA"),
    ("de", "DE"),
    ("el", "EL"),
    ("en", "EN"),
    ("en-gb", "EN-GB"),
    ("en-us", "EN-US"),
    ("es", "ES"),
    ("et", "ET"),
    ("fi", "FI"),
    ("fr", "FR"),
    ("hu", "HU"),
    ("id", "ID"),
    ("it", "IT"),
    ("ja", "JA"),
    ("ko", "KO"),
    ("lt", "LT"),
    ("lv", "LV"),
    ("nb", "NB"),
    ("nl", "NL"),
    ("pl", "PL"),
    ("pt", "PT"),
    ("pt-br", "PT-BR"),
    ("pt-pt", "PT-PT"),
    ("ro", "RO"),
    ("ru", "RU"),
    ("sk", "SK"),
    ("sl", "SL"),
    ("sv", "SV"),
    ("tr", "TR"),
    ("uk", "UK"),
    ("zh", "ZH"),
    ("zh-cn", "ZH"),
    ("zh-hans", "ZH"),
];

/// DeepL REST API v2 client.
pub struct DeeplProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    target_lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_lang: Option<String>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
    text: String,
}

impl DeeplProvider {
    pub fn new(client: reqwest::Client, api_key: SecretString, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Free-plan keys end in `:fx` and live on a separate host.
    pub fn default_base(api_key: &SecretString) -> &'static str {
        if api_key.expose_secret().ends_with(":fx") {
            "https://api-free.deepl.com"
        } else {
            "https://api.deepl.com"
        }
    }

    /// DeepL's spelling of `lang`; unknown codes are just uppercased.
    fn normalize(lang: &str) -> String {
        let lang = lang.to_lowercase();
        LANGUAGES
            .iter()
            .find(|(code, _)| *code == lang)
            .map(|(_, deepl)| deepl.to_string())
            .unwrap_or_else(|| lang.to_uppercase())
    }
}

#[async_trait]
impl TranslationProvider for DeeplProvider {
    fn name(&self) -> &str {
        "deepl"
    }

    fn supports_language(&self, lang: &str) -> bool {
        let lang = lang.to_lowercase();
        LANGUAGES.iter().any(|(code, _)| *code == lang)
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
            text: [text],
            target_lang: Self::normalize(target),
            // Source codes are base languages only (EN, PT, ZH).
            source_lang: source.map(|s| {
                let base = s.split('-').next().unwrap_or(s);
                base.to_uppercase()
            }),
        };

        let response = self
            .client
            .post(format!("{}/v2/translate", self.base_url))
            .header(
                "Authorization",
                format!("DeepL-Auth-Key {}", self.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text, Some(QUOTA_EXCEEDED)));
        }

        let parsed: TranslateResponse = response.json().await?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| TranslateError::Transient("DeepL returned no translations".into()))
    }
}
