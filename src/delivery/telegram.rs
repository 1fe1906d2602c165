//! Telegram publisher: posts items to a channel via the Bot API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::config::TelegramConfig;
use crate::delivery::Publisher;
use crate::error::DeliveryError;
use crate::items::Item;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const PUBLISHER_NAME: &str = "telegram";

pub struct TelegramPublisher {
    bot_token: SecretString,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramPublisher {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token,
            chat_id: config.chat_id,
            api_base: "https://api.telegram.org".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Send a single chunk (≤4096 chars), Markdown-first. A 400 on the
    /// Markdown attempt usually means the markup did not parse, so it is
    /// retried as plain text; any other status is classified directly.
    async fn send_chunk(&self, text: &str) -> Result<(), DeliveryError> {
        let markdown_body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": false,
        });
        let (status, body) = self.post("sendMessage", &markdown_body).await?;
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::BAD_REQUEST {
            return Err(classify(status, &body));
        }

        tracing::warn!(
            status = ?status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );
        let plain_body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        let (status, body) = self.post("sendMessage", &plain_body).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(classify(status, &body))
    }

    async fn post(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<(StatusCode, String), DeliveryError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                publisher: PUBLISHER_NAME.into(),
                // reqwest errors embed the URL, which carries the token.
                reason: e.without_url().to_string(),
            })?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    fn name(&self) -> &str {
        PUBLISHER_NAME
    }

    async fn publish(&self, item: &Item) -> Result<(), DeliveryError> {
        let text = render(item);
        for chunk in split_message(&text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(&chunk).await?;
        }
        tracing::debug!(key = %item.key, chat_id = %self.chat_id, "Posted item to Telegram");
        Ok(())
    }
}

/// Map a non-success Bot API response to a delivery error.
fn classify(status: StatusCode, body: &str) -> DeliveryError {
    let description = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["description"].as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {status}"));

    match status {
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimited {
            publisher: PUBLISHER_NAME.into(),
            retry_after: retry_after(body),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryError::Blocked {
            publisher: PUBLISHER_NAME.into(),
            reason: description,
        },
        StatusCode::BAD_REQUEST => DeliveryError::Rejected {
            publisher: PUBLISHER_NAME.into(),
            reason: description,
        },
        _ => DeliveryError::SendFailed {
            publisher: PUBLISHER_NAME.into(),
            reason: description,
        },
    }
}

fn retry_after(body: &str) -> Option<Duration> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .pointer("/parameters/retry_after")?
        .as_u64()
        .map(Duration::from_secs)
}

/// Post body for an item: bold title, then brand, price, and link lines.
fn render(item: &Item) -> String {
    let mut lines = vec![format!("*{}*", escape_markdown(&item.title))];
    if let Some(brand) = &item.brand {
        lines.push(escape_markdown(brand));
    }
    if let Some(price) = &item.price {
        lines.push(format!("Price: {price}"));
    }
    if let Some(url) = &item.url {
        lines.push(url.clone());
    }
    lines.join("\n")
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split a message into chunks of at most `max_chars` characters.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((cut, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..cut];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
