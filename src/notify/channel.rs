use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{chat, webhook};
use crate::error::{PipelineError, Result};
use crate::models::{Alert, ChannelConfig, ChannelTarget};

/// One delivery attempt to one channel. Implementations do not retry.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, target: &ChannelTarget, alert: &Alert, escalation: bool) -> Result<()>;
}

/// Sends chat and generic webhook payloads over HTTP.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("llm-watch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn headers(raw: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (k, v) in raw {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| PipelineError::validation(format!("invalid header name '{}'", k)))?;
        let value = HeaderValue::from_str(v)
            .map_err(|_| PipelineError::validation(format!("invalid value for header '{}'", k)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl NotificationSender for HttpSender {
    async fn send(&self, target: &ChannelTarget, alert: &Alert, escalation: bool) -> Result<()> {
        let request = match &target.config {
            ChannelConfig::Chat(cfg) => self.client.post(&cfg.webhook_url).json(&chat::payload(cfg, alert, escalation)),
            ChannelConfig::Webhook(cfg) => self
                .client
                .request(webhook::method(cfg)?, &cfg.url)
                .headers(headers(&cfg.headers)?)
                .json(&webhook::payload(alert, escalation)),
        };
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::notification(
            Some(status.as_u16()),
            format!("{} responded {}: {}", target.config.channel_type(), status, body.chars().take(200).collect::<String>()),
        ))
    }
}
