use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use llm_watch_pipeline::notify::{Dispatcher, NotificationSender};
use llm_watch_pipeline::{Alert, ChannelTarget, Event, MemoryStore, Pipeline, PipelineConfig, Result};

/// Records every send instead of going over the network.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, target: &ChannelTarget, alert: &Alert, escalation: bool) -> Result<()> {
        self.sent.lock().push((target.id.clone(), alert.id.clone(), escalation));
        Ok(())
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryStore>,
    pub sender: Arc<RecordingSender>,
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::default());
    let mut config = PipelineConfig::default();
    config.notifications.initial_backoff_ms = 1;
    config.notifications.max_backoff_ms = 2;
    let dispatcher = Dispatcher::with_sender(&config.notifications, store.clone(), sender.clone());
    let pipeline = Arc::new(Pipeline::with_dispatcher(config, store.clone(), dispatcher));
    Harness { pipeline, store, sender }
}

#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn keyword_rule(name: &str, pattern: &str, points: u32, priority: i32, stop: bool) -> Value {
    json!({
        "name": name,
        "description": "",
        "category": "security",
        "rule_type": "keyword",
        "pattern": pattern,
        "severity": "high",
        "points": points,
        "priority": priority,
        "stop_on_match": stop,
        "combination_logic": "OR",
        "is_active": true
    })
}

#[allow(dead_code)]
pub fn detection_alert_rule(name: &str, severity: &str, rule_ids: &[&str]) -> Value {
    json!({
        "name": name,
        "rule_type": "detection_rule",
        "severity": severity,
        "detection_rule_ids": rule_ids,
        "notifications": {
            "slack": {"webhook_url": "https://hooks.example/chat", "channel": "#llm-alerts"},
            "webhook": {"url": "https://hooks.example/generic"}
        }
    })
}

#[allow(dead_code)]
pub fn event(id: &str, source: &str, prompt: &str, at: DateTime<Utc>) -> Event {
    Event::new(source, "openai", "gpt-4", prompt, at).with_id(id)
}
