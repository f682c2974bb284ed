use serde_json::{json, Value};

use crate::models::{Alert, ChatWebhookConfig, Severity};

fn color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#8b0000",
        Severity::High => "#e01e5a",
        Severity::Medium => "#ecb22e",
        Severity::Low => "#2eb67d",
    }
}

/// Slack-compatible incoming-webhook message for one alert.
pub fn payload(config: &ChatWebhookConfig, alert: &Alert, escalation: bool) -> Value {
    let prefix = if escalation { "[ESCALATED] " } else { "" };
    let text = format!("{}{} alert: {}", prefix, alert.severity.as_str().to_uppercase(), alert.title);

    let mut fields = vec![
        json!({"title": "Severity", "value": alert.severity.as_str(), "short": true}),
        json!({"title": "Status", "value": alert.status.as_str(), "short": true}),
        json!({"title": "Source kind", "value": alert.source_kind.as_str(), "short": true}),
    ];
    if let Some(src) = &alert.source_address {
        fields.push(json!({"title": "Source address", "value": src, "short": true}));
    }
    if let Some(rule) = &alert.alert_rule {
        fields.push(json!({"title": "Alert rule", "value": rule, "short": true}));
    }
    if let Some(matched) = alert.metadata.get("matched_rules").and_then(Value::as_array) {
        let names: Vec<&str> = matched.iter().filter_map(Value::as_str).collect();
        if !names.is_empty() {
            fields.push(json!({"title": "Matched rules", "value": names.join(", "), "short": false}));
        }
    }
    let dup = alert.duplicate_count();
    if dup > 0 {
        fields.push(json!({"title": "Duplicates", "value": dup.to_string(), "short": true}));
    }

    let mut body = json!({
        "text": text,
        "attachments": [{
            "color": color(alert.severity),
            "fallback": text,
            "fields": fields,
            "footer": format!("alert {}", alert.id),
            "ts": alert.created_at.timestamp(),
        }]
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(channel) = &config.channel {
            obj.insert("channel".to_string(), json!(channel));
        }
        if let Some(username) = &config.username {
            obj.insert("username".to_string(), json!(username));
        }
        if let Some(icon) = &config.icon {
            let key = if icon.starts_with(':') { "icon_emoji" } else { "icon_url" };
            obj.insert(key.to_string(), json!(icon));
        }
    }
    body
}
