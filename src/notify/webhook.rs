use reqwest::Method;
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};
use crate::models::{Alert, WebhookConfig};

/// Structured body for generic webhooks: the full alert plus delivery context.
pub fn payload(alert: &Alert, escalation: bool) -> Value {
    json!({
        "type": if escalation { "alert.escalated" } else { "alert.created" },
        "escalation": escalation,
        "alert": alert,
    })
}

pub fn method(config: &WebhookConfig) -> Result<Method> {
    let m = config.method.trim().to_uppercase();
    match m.as_str() {
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        other => Err(PipelineError::validation(format!("unsupported webhook method '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cfg(method: &str) -> WebhookConfig {
        WebhookConfig { url: "https://x".into(), method: method.into(), headers: BTreeMap::new(), enabled: true }
    }

    #[test]
    fn methods_are_limited_to_body_carrying_verbs() {
        assert_eq!(method(&cfg("post")).unwrap(), Method::POST);
        assert_eq!(method(&cfg("PUT")).unwrap(), Method::PUT);
        assert!(method(&cfg("GET")).is_err());
    }
}
