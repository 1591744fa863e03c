//! Minimal Telegram Bot API client for outbound messages.

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Clone)]
pub struct TelegramClient {
    token: Option<String>,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build telegram http client");
        Self { token, client }
    }

    pub fn configured(&self) -> bool {
        self.token.is_some()
    }

    /// Send a message; failures are logged and swallowed — notification
    /// delivery is best effort by contract.
    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> bool {
        let Some(ref token) = self.token else {
            warn!("telegram not configured (missing bot token)");
            return false;
        };
        if chat_id.is_empty() {
            warn!("telegram not configured (missing chat id)");
            return false;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let mut form: Vec<(&str, String)> = vec![
            ("chat_id", chat_id.to_string()),
            ("text", text.to_string()),
            ("disable_web_page_preview", "true".to_string()),
        ];
        if let Some(markup) = reply_markup {
            if let Ok(encoded) = serde_json::to_string(markup) {
                form.push(("reply_markup", encoded));
            }
        }
        match self.client.post(&url).form(&form).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(chat_id, status = %resp.status(), "telegram send rejected");
                false
            }
            Err(e) => {
                warn!(chat_id, error = %e, "telegram send failed");
                false
            }
        }
    }
}
