//! Minimal Telegram Bot API client used by the server for notifications and
//! error alerts.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::notify::{Button, Notification, Notifier};

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    description: Option<String>,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{bot_token}"))
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// `sendMessage` with HTML parse mode and an optional one-row inline keyboard.
    pub async fn send_message(&self, chat_id: &str, text: &str, buttons: &[Button]) -> anyhow::Result<()> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if !buttons.is_empty() {
            body["reply_markup"] = keyboard(buttons);
        }

        let response: BotApiResponse = self
            .http
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?
            .json()
            .await
            .context("sendMessage returned malformed body")?;

        if !response.ok {
            anyhow::bail!(
                "sendMessage rejected: {}",
                response.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(())
    }
}

fn keyboard(buttons: &[Button]) -> serde_json::Value {
    let row: Vec<_> = buttons
        .iter()
        .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
        .collect();
    json!({ "inline_keyboard": [row] })
}

#[async_trait]
impl Notifier for TelegramApi {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.send_message(&notification.chat_id, &notification.text(), &notification.buttons())
            .await
    }
}
