use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "POST".to_string()
}

/// Chat webhook target (Slack-compatible incoming webhook).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatWebhookConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, alias = "icon_emoji")]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Generic HTTP webhook target receiving the alert as structured JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel_type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Chat(ChatWebhookConfig),
    Webhook(WebhookConfig),
}

impl ChannelConfig {
    pub fn channel_type(&self) -> &'static str {
        match self {
            ChannelConfig::Chat(_) => "chat",
            ChannelConfig::Webhook(_) => "webhook",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            ChannelConfig::Chat(c) => c.enabled,
            ChannelConfig::Webhook(c) => c.enabled,
        }
    }

    /// Target URL; used as the rate-limit key so rules sharing a hook share its budget.
    pub fn endpoint(&self) -> &str {
        match self {
            ChannelConfig::Chat(c) => &c.webhook_url,
            ChannelConfig::Webhook(c) => &c.url,
        }
    }
}

/// A channel resolved for one alert rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTarget {
    pub id: String,
    pub config: ChannelConfig,
}

/// `notifications: {channel_type: config}` as found on alert rule definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationTargets(pub BTreeMap<String, serde_json::Value>);

impl NotificationTargets {
    /// Resolve the raw map into typed channels. Entries that fail to decode or
    /// name an unknown channel type come back as warnings instead of errors.
    pub fn resolve(&self, rule: &str) -> (Vec<ChannelTarget>, Vec<String>) {
        let mut channels = Vec::new();
        let mut warnings = Vec::new();
        for (kind, raw) in &self.0 {
            let decoded = match kind.as_str() {
                "slack" | "chat" | "chat_webhook" => {
                    serde_json::from_value::<ChatWebhookConfig>(raw.clone()).map(ChannelConfig::Chat)
                }
                "webhook" | "generic_webhook" => {
                    serde_json::from_value::<WebhookConfig>(raw.clone()).map(ChannelConfig::Webhook)
                }
                other => {
                    warnings.push(format!("{}: unknown channel type '{}'", rule, other));
                    continue;
                }
            };
            match decoded {
                Ok(config) => channels.push(ChannelTarget { id: format!("{}:{}", rule, kind), config }),
                Err(e) => warnings.push(format!("{}: invalid '{}' channel config: {}", rule, kind, e)),
            }
        }
        (channels, warnings)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { reason: String },
}

/// Delivery record for one (alert, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub alert_id: String,
    pub channel_id: String,
    pub channel_type: String,
    pub outcome: DeliveryOutcome,
    pub timestamp: DateTime<Utc>,
    /// Retries after the first send.
    pub retry_count: u32,
    pub escalation: bool,
}

impl NotificationAttempt {
    pub fn delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_channels_and_reports_bad_ones() {
        let targets: NotificationTargets = serde_json::from_value(serde_json::json!({
            "slack": {"webhook_url": "https://hooks.example/T1", "channel": "#sec", "username": "watch", "icon": ":rotating_light:"},
            "webhook": {"url": "https://ir.example/alerts", "headers": {"X-Token": "abc"}},
            "pager": {"key": "zzz"},
            "chat": {"channel": "#missing-url"}
        }))
        .unwrap();
        let (channels, warnings) = targets.resolve("High Risk");
        assert_eq!(channels.len(), 2);
        assert!(channels.iter().any(|c| c.id == "High Risk:slack" && c.config.channel_type() == "chat"));
        let hook = channels.iter().find(|c| c.config.channel_type() == "webhook").unwrap();
        match &hook.config {
            ChannelConfig::Webhook(w) => {
                assert_eq!(w.method, "POST");
                assert_eq!(w.headers.get("X-Token").map(String::as_str), Some("abc"));
            }
            _ => unreachable!(),
        }
        assert_eq!(warnings.len(), 2);
    }
}
