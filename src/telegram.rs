use crate::config::TelegramSettings;
use crate::error::TradingError;
use crate::providers::NotificationChannel;
use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// Sends plain-text notifications to a Telegram chat through the Bot API.
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Returns `None` when the token or chat id is blank.
    pub fn new(settings: &TelegramSettings, timeout: Duration) -> Result<Option<Self>, TradingError> {
        if settings.bot_token.trim().is_empty() || settings.chat_id.trim().is_empty() {
            return Ok(None);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TradingError::DataUnavailable(format!("HTTP client: {}", err)))?;
        Ok(Some(Self {
            client,
            api_url: TELEGRAM_API_URL.to_string(),
            token: settings.bot_token.clone(),
            chat_id: settings.chat_id.clone(),
        }))
    }
}

#[async_trait]
impl NotificationChannel for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), TradingError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let escaped = escape_markdown(text);
        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: &escaped,
            parse_mode: "MarkdownV2",
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(TradingError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(TradingError::from_status(status, body));
        }
        Ok(())
    }
}

/// Writes notifications to the log when no chat is configured.
pub struct LogNotifier;

#[async_trait]
impl NotificationChannel for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), TradingError> {
        info!("[notification]\n{}", text);
        Ok(())
    }
}

/// Escapes the characters that carry meaning in Telegram MarkdownV2.
pub fn escape_markdown(text: &str) -> String {
    const SPECIAL: &str = r"\_*[]()~`>#+-=|{}.!";
    let mut escaped = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        if SPECIAL.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
