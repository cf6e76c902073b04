//! Chat platform client.
//!
//! [`DiscordClient`] is built once at startup and shared behind an `Arc`;
//! every pipeline run reuses its connection pool. Tests substitute their own
//! [`ChatPlatform`] implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::{StageError, StageResult};

/// Discord channel type for categories.
pub const CATEGORY_KIND: u8 = 4;

/// Embed colour used for every notice the archiver posts.
pub const NOTICE_COLOR: u32 = 0xff3864;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
}

/// A short embed posted into a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn export_failed() -> Self {
        Self::new(
            "Channel Export Failed",
            "The export of this channel failed. Please try again later.",
        )
    }

    fn to_embed(&self) -> serde_json::Value {
        json!({
            "title": self.title,
            "description": self.description,
            "color": NOTICE_COLOR,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn channel(&self, channel_id: &str) -> StageResult<ChannelInfo>;

    async fn guild_channels(&self, guild_id: &str) -> StageResult<Vec<ChannelInfo>>;

    async fn rename_channel(&self, channel_id: &str, name: &str) -> StageResult<()>;

    async fn move_channel(&self, channel_id: &str, parent_id: &str) -> StageResult<()>;

    async fn send_notice(&self, channel_id: &str, notice: &Notice) -> StageResult<()>;

    async fn channel_name(&self, channel_id: &str) -> StageResult<String> {
        Ok(self.channel(channel_id).await?.name)
    }
}

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl DiscordClient {
    pub fn new(config: &ChatConfig, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!(
                "DiscordBot (https://github.com/channel-archive, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Send a request, waiting out one rate-limit response.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> StageResult<reqwest::Response> {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(ref body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            let status = resp.status();

            if status.as_u16() == 429 && attempt == 0 {
                attempt += 1;
                let wait = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()))
                    .unwrap_or(1.0)
                    .min(30.0);
                debug!(path, wait, "rate limited by chat platform");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }
            if status.is_success() {
                return Ok(resp);
            }

            let text = resp.text().await.unwrap_or_default();
            let detail = format!(
                "{} {} → HTTP {}: {}",
                method,
                path,
                status,
                text.chars().take(300).collect::<String>()
            );
            return Err(match status.as_u16() {
                401 | 403 => StageError::Permission(detail),
                _ => StageError::Transport(detail),
            });
        }
    }
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn channel(&self, channel_id: &str) -> StageResult<ChannelInfo> {
        let resp = self
            .send(reqwest::Method::GET, &format!("/channels/{}", channel_id), None)
            .await?;
        Ok(resp.json().await?)
    }

    async fn guild_channels(&self, guild_id: &str) -> StageResult<Vec<ChannelInfo>> {
        let resp = self
            .send(
                reqwest::Method::GET,
                &format!("/guilds/{}/channels", guild_id),
                None,
            )
            .await?;
        Ok(resp.json().await?)
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> StageResult<()> {
        self.send(
            reqwest::Method::PATCH,
            &format!("/channels/{}", channel_id),
            Some(json!({ "name": name })),
        )
        .await?;
        Ok(())
    }

    async fn move_channel(&self, channel_id: &str, parent_id: &str) -> StageResult<()> {
        self.send(
            reqwest::Method::PATCH,
            &format!("/channels/{}", channel_id),
            Some(json!({ "parent_id": parent_id })),
        )
        .await?;
        Ok(())
    }

    async fn send_notice(&self, channel_id: &str, notice: &Notice) -> StageResult<()> {
        self.send(
            reqwest::Method::POST,
            &format!("/channels/{}/messages", channel_id),
            Some(json!({ "embeds": [notice.to_embed()] })),
        )
        .await?;
        Ok(())
    }
}

/// Post a notice, logging rather than returning a failure.
pub async fn notify_best_effort(chat: &dyn ChatPlatform, channel_id: &str, notice: &Notice) {
    if let Err(e) = chat.send_notice(channel_id, notice).await {
        warn!(channel = channel_id, error = %e, title = %notice.title, "notice not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_payload_decodes() {
        let raw = r#"{"id":"42","name":"general","type":0,"parent_id":"9","guild_id":"1","position":3}"#;
        let ch: ChannelInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(ch.name, "general");
        assert_eq!(ch.parent_id.as_deref(), Some("9"));
        assert_eq!(ch.kind, 0);

        let category: ChannelInfo =
            serde_json::from_str(r#"{"id":"9","name":"Archive","type":4,"parent_id":null}"#)
                .unwrap();
        assert_eq!(category.kind, CATEGORY_KIND);
        assert!(category.parent_id.is_none());
    }

    #[test]
    fn notice_embed_shape() {
        let embed = Notice::export_failed().to_embed();
        assert_eq!(embed["title"], "Channel Export Failed");
        assert_eq!(embed["color"], NOTICE_COLOR);
        assert!(embed["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
