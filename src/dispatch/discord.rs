use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::destination::{classify_status, retry_after_secs, Destination, SendError};
use super::message::ComposedMessage;
use crate::util::truncate_chars;

/// Embed field values are capped at 1024 characters by Discord.
const MAX_SUMMARY_CHARS: usize = 1000;
/// Embed description limit is 4096; keep well under it.
const MAX_TITLE_CHARS: usize = 256;
const EMBED_COLOR: u32 = 0x3498db;

/// Discord REST `POST /channels/{id}/messages` with one embed.
pub struct DiscordDestination {
    client: reqwest::Client,
    token: SecretString,
    api_url: String,
}

#[derive(Deserialize, Default)]
struct RateLimited {
    /// Seconds, possibly fractional
    retry_after: Option<f64>,
    message: Option<String>,
}

impl DiscordDestination {
    pub fn new(client: reqwest::Client, token: SecretString, api_url: &str) -> Self {
        Self {
            client,
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn embed(message: &ComposedMessage) -> serde_json::Value {
        let title = truncate_chars(&message.title, MAX_TITLE_CHARS);
        let mut embed = json!({
            "description": format!("[{}]({})", title, message.link),
            "color": EMBED_COLOR,
            "footer": {"text": format!("Source: {}", message.source)},
        });

        if let Some(ts) = message.datetime() {
            embed["timestamp"] = json!(ts.to_rfc3339());
        }
        if let Some(summary) = message.summary.as_deref().filter(|s| !s.is_empty()) {
            embed["fields"] = json!([{
                "name": "Summary",
                "value": truncate_chars(summary, MAX_SUMMARY_CHARS),
                "inline": false,
            }]);
        }
        if let Some(image) = &message.image_url {
            embed["image"] = json!({"url": image});
        }
        embed
    }
}

#[async_trait]
impl Destination for DiscordDestination {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn send(&self, channel_id: &str, message: &ComposedMessage) -> Result<(), SendError> {
        // Snowflakes are numeric; anything else would be spliced into the path.
        if channel_id.is_empty() || !channel_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SendError::Terminal(format!(
                "Invalid Discord channel id: {channel_id}"
            )));
        }

        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_url, channel_id))
            .header(
                "Authorization",
                format!("Bot {}", self.token.expose_secret()),
            )
            .json(&json!({"embeds": [Self::embed(message)]}))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            let body: RateLimited = serde_json::from_str(&text).unwrap_or_default();
            let retry_after = body.retry_after.and_then(retry_after_secs);
            return Err(SendError::Retryable {
                reason: format!(
                    "HTTP 429: {}",
                    body.message.unwrap_or_else(|| "rate limited".into())
                ),
                retry_after,
            });
        }

        let detail: String = text.chars().take(200).collect();
        Err(classify_status(status, &headers, detail.trim()))
    }
}
