use async_trait::async_trait;
use serde::Serialize;

use super::destination::{classify_status, Destination, SendError};
use super::message::ComposedMessage;
use crate::util::validate_url;

/// Generic JSON webhook. The subscription's channel id is the target URL.
pub struct WebhookDestination {
    client: reqwest::Client,
    allow_private_networks: bool,
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub title: &'a str,
    pub summary: Option<&'a str>,
    pub link: &'a str,
    pub source: &'a str,
    /// RFC 3339, UTC
    pub published_at: Option<String>,
    pub image_url: Option<&'a str>,
    pub language: Option<&'a str>,
}

impl<'a> From<&'a ComposedMessage> for WebhookPayload<'a> {
    fn from(message: &'a ComposedMessage) -> Self {
        Self {
            title: &message.title,
            summary: message.summary.as_deref(),
            link: &message.link,
            source: &message.source,
            published_at: message.datetime().map(|dt| dt.to_rfc3339()),
            image_url: message.image_url.as_deref(),
            language: message.language.as_deref(),
        }
    }
}

impl WebhookDestination {
    /// `client` should not follow redirects, or a public URL could bounce
    /// the request onto an internal address.
    pub fn new(client: reqwest::Client, allow_private_networks: bool) -> Self {
        Self {
            client,
            allow_private_networks,
        }
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn platform(&self) -> &str {
        "webhook"
    }

    async fn send(&self, channel_id: &str, message: &ComposedMessage) -> Result<(), SendError> {
        let url = validate_url(channel_id, self.allow_private_networks)
            .map_err(|e| SendError::Terminal(format!("Webhook URL rejected: {e}")))?;

        let response = self
            .client
            .post(url)
            .json(&WebhookPayload::from(message))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_redirection() {
            return Err(SendError::Terminal(format!(
                "Webhook answered with redirect {}",
                status.as_u16()
            )));
        }

        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        let detail: String = text.chars().take(200).collect();
        Err(classify_status(status, &headers, detail.trim()))
    }
}
