use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Serialize;

use crate::config::TelegramSettings;
use crate::retry::RetryPolicy;

/// Outbound channel for human-readable progress and error messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Deliver a message, logging instead of failing. Notifications never
/// affect the outcome of a job.
pub async fn notify_best_effort(notifier: &dyn Notifier, retry: &RetryPolicy, message: &str) {
    debug!("notify: {}", message);
    if let Err(e) = retry.run("notification", move |_| notifier.send(message)).await {
        warn!("Notification dropped: {:#}", e);
    }
}

/// Silently drops every message; used when no channel is configured
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// Telegram bot `sendMessage`
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    settings: TelegramSettings,
}

impl TelegramNotifier {
    pub fn new(client: Client, settings: TelegramSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.token
        );
        self.client
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.settings.chat_id,
                text: &escape_html(message),
                parse_mode: "HTML",
            })
            .send()
            .await
            // The URL holds the bot token, keep it out of logs
            .map_err(|e| e.without_url())
            .context("Telegram request failed")?
            .error_for_status()
            .map_err(|e| e.without_url())
            .context("Telegram rejected the message")?;
        Ok(())
    }
}

/// Escape the characters Telegram's HTML parse mode treats as markup
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
