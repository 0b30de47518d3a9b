use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::provider::{status_error, TranslateError, TranslationProvider};

/// Human-readable names give noticeably better prompts than ISO codes.
const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("zh", "Simplified Chinese"),
    ("zh-cn", "Simplified Chinese"),
    ("zh-hans", "Simplified Chinese"),
    ("zh-tw", "Traditional Chinese"),
    ("zh-hant", "Traditional Chinese"),
    ("en", "English"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("fr", "French"),
    ("de", "German"),
    ("es", "Spanish"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("ar", "Arabic"),
    ("hi", "Hindi"),
    ("it", "Italian"),
    ("nl", "Dutch"),
    ("pl", "Polish"),
    ("tr", "Turkish"),
    ("vi", "Vietnamese"),
    ("th", "Thai"),
    ("id", "Indonesian"),
    ("ms", "Malay"),
];

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 2000;

/// Chat-completions translator for OpenAI and compatible servers.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    pub const DEFAULT_BASE: &'static str = "https://api.openai.com/v1";

    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: String,
        model: String,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url,
            model,
        }
    }

    fn language_name(lang: &str) -> String {
        let lower = lang.to_lowercase();
        LANGUAGE_NAMES
            .iter()
            .find(|(code, _)| *code == lower)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| lang.to_string())
    }

    fn system_prompt(target: &str, source: Option<&str>) -> String {
        let direction = match source {
            Some(source) => format!(
                "from {} to {}",
                Self::language_name(source),
                Self::language_name(target)
            ),
            None => format!("to {}", Self::language_name(target)),
        };
        format!(
            "You are a professional translator. Translate the following text {direction}. \
             Preserve the original meaning and tone. Only output the translated text, nothing else."
        )
    }
}

#[async_trait]
impl TranslationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_language(&self, _lang: &str) -> bool {
        true
    }

    async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<String, TranslateError> {
        let prompt = Self::system_prompt(target, source);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: &prompt,
                },
                Message {
                    role: "user",
                    content: text,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text, None));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| TranslateError::Transient("Model returned an empty completion".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    #[test]
    fn test_system_prompt_names_languages() {
        assert_eq!(
            OpenAiProvider::system_prompt("zh-TW", Some("en")),
            "You are a professional translator. Translate the following text from English to \
             Traditional Chinese. Preserve the original meaning and tone. Only output the \
             translated text, nothing else."
        );
        assert!(OpenAiProvider::system_prompt("sw", None).contains("text to sw."));
    }

    #[tokio::test]
    async fn test_translate_trims_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(|req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                assert_eq!(body["model"], "gpt-4o-mini");
                assert_eq!(body["messages"][1]["content"], "Bonjour");
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": " Hello \n"}}]
                }))
            })
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(
            reqwest::Client::new(),
            SecretString::from("sk-test"),
            server.uri(),
            "gpt-4o-mini".into(),
        );
        assert!(provider.supports_language("tlh"));
        assert_eq!(provider.translate("Bonjour", "en", None).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(
            reqwest::Client::new(),
            SecretString::from("sk-test"),
            server.uri(),
            "gpt-4o-mini".into(),
        );
        let err = provider.translate("Bonjour", "en", None).await.unwrap_err();
        assert_eq!(err, TranslateError::Transient("HTTP 503: overloaded".into()));
    }
}
