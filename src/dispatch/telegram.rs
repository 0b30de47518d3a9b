use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::destination::{classify_status, Destination, SendError};
use super::message::ComposedMessage;
use crate::util::truncate_chars;

const MAX_SUMMARY_CHARS: usize = 500;

/// Bot API descriptions that mean the chat is gone or the bot lost access.
const CHAT_GONE_ERRORS: &[&str] = &[
    "Bad Request: CHAT_WRITE_FORBIDDEN",
    "Bad Request: chat not found",
    "Bad Request: group chat was upgraded to a supergroup chat",
    "Bad Request: have no rights to send a message",
    "Bad Request: need administrator rights in the channel chat",
    "Forbidden:",
];

/// Telegram Bot API `sendMessage` with HTML formatting.
pub struct TelegramDestination {
    client: reqwest::Client,
    token: SecretString,
    api_url: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize, Default)]
struct ApiResponse {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

impl TelegramDestination {
    pub fn new(client: reqwest::Client, token: SecretString, api_url: &str) -> Self {
        Self {
            client,
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Render `message` as Bot API HTML.
    pub fn format(message: &ComposedMessage) -> String {
        let mut parts = vec![format!("<b>{}</b>", escape_html(&message.title)), String::new()];

        if let Some(summary) = message.summary.as_deref().filter(|s| !s.is_empty()) {
            parts.push(escape_html(&truncate_chars(summary, MAX_SUMMARY_CHARS)));
            parts.push(String::new());
        }

        parts.push(format!(
            "🔗 <a href=\"{}\">Read more</a>",
            escape_html(&message.link)
        ));
        parts.push(format!("📰 {}", escape_html(&message.source)));

        let time = message.display_time();
        if !time.is_empty() {
            parts.push(format!("🕐 {time}"));
        }

        parts.join("\n")
    }
}

/// Escape the characters the Bot API's HTML parse mode treats specially.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl Destination for TelegramDestination {
    fn platform(&self) -> &str {
        "telegram"
    }

    async fn send(&self, channel_id: &str, message: &ComposedMessage) -> Result<(), SendError> {
        let body = SendMessage {
            chat_id: channel_id,
            text: Self::format(message),
            parse_mode: "HTML",
            disable_web_page_preview: false,
        };

        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_url,
            self.token.expose_secret()
        );
        let response = self.client.post(url).json(&body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let headers = response.headers().clone();
        let api: ApiResponse = response.json().await.unwrap_or_default();
        let description = api.description.unwrap_or_default();

        if status.as_u16() == 429 {
            let retry_after = api
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);
            return Err(SendError::Retryable {
                reason: format!("HTTP 429: {description}"),
                retry_after,
            });
        }

        if CHAT_GONE_ERRORS.iter().any(|e| description.contains(e)) {
            return Err(SendError::Terminal(description));
        }

        Err(classify_status(status, &headers, &description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> ComposedMessage {
        ComposedMessage {
            title: "Rust <1.80> & friends".into(),
            summary: Some("Fast & safe".into()),
            link: "https://example.com/a?x=1&y=2".into(),
            source: "Example".into(),
            timestamp: 1_704_110_400,
            image_url: None,
            language: None,
        }
    }

    fn destination(server: &MockServer) -> TelegramDestination {
        TelegramDestination::new(
            reqwest::Client::new(),
            SecretString::from("123:abc"),
            &server.uri(),
        )
    }

    #[test]
    fn test_format_escapes_html() {
        assert_eq!(
            TelegramDestination::format(&message()),
            "<b>Rust &lt;1.80&gt; &amp; friends</b>\n\nFast &amp; safe\n\n\
             🔗 <a href=\"https://example.com/a?x=1&amp;y=2\">Read more</a>\n📰 Example\n🕐 2024-01-01 12:00"
        );
    }

    #[test]
    fn test_format_without_summary() {
        let mut msg = message();
        msg.summary = None;
        let text = TelegramDestination::format(&msg);
        assert!(text.starts_with("<b>Rust &lt;1.80&gt; &amp; friends</b>\n\n🔗"));
    }

    #[tokio::test]
    async fn test_send_posts_html_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": "-1001",
                "parse_mode": "HTML"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        destination(&server).send("-1001", &message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 3",
                "parameters": {"retry_after": 3}
            })))
            .mount(&server)
            .await;

        let err = destination(&server).send("1", &message()).await.unwrap_err();
        assert_eq!(
            err,
            SendError::Retryable {
                reason: "HTTP 429: Too Many Requests: retry after 3".into(),
                retry_after: Some(Duration::from_secs(3)),
            }
        );
    }

    #[tokio::test]
    async fn test_blocked_bot_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let err = destination(&server).send("1", &message()).await.unwrap_err();
        assert_eq!(
            err,
            SendError::Terminal("Forbidden: bot was blocked by the user".into())
        );
    }

    #[tokio::test]
    async fn test_bad_markup_is_rejected_not_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Bad Request: can't parse entities"
            })))
            .mount(&server)
            .await;

        let err = destination(&server).send("1", &message()).await.unwrap_err();
        assert!(matches!(err, SendError::Rejected(_)));
    }
}
