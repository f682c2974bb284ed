use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use super::notification::NotificationTargets;
use super::rule::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSourceKind {
    DetectionRule,
    Threshold,
    System,
}

impl AlertSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSourceKind::DetectionRule => "detection_rule",
            AlertSourceKind::Threshold => "threshold",
            AlertSourceKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub source_kind: AlertSourceKind,
    /// Name of the alert rule that produced the alert, if any.
    pub alert_rule: Option<String>,
    pub source_address: Option<String>,
    pub event_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl Alert {
    pub fn is_unresolved(&self) -> bool {
        self.status != AlertStatus::Resolved
    }

    pub fn duplicate_count(&self) -> u64 {
        self.metadata.get("duplicate_count").and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn is_escalated(&self) -> bool {
        self.metadata.get("escalated").and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRuleKind {
    Threshold,
    DetectionRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    AvgRiskScore,
    MaxRiskScore,
    RequestCount,
    FlaggedCount,
    FlaggedRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    #[serde(alias = ">=", alias = "gte")]
    GreaterThanOrEqual,
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    #[serde(alias = "<=", alias = "lte")]
    LessThanOrEqual,
    #[serde(alias = "==", alias = "eq", alias = "equals")]
    Equal,
    #[serde(alias = "!=", alias = "ne")]
    NotEqual,
}

impl ThresholdMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdMetric::AvgRiskScore => "avg_risk_score",
            ThresholdMetric::MaxRiskScore => "max_risk_score",
            ThresholdMetric::RequestCount => "request_count",
            ThresholdMetric::FlaggedCount => "flagged_count",
            ThresholdMetric::FlaggedRatio => "flagged_ratio",
        }
    }
}

/// Relative tolerance for equality comparisons on window metrics.
const EQUALITY_TOLERANCE: f64 = 1e-9;

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
        }
    }

    /// `Equal` and `NotEqual` compare up to float rounding, scaled to the
    /// threshold: an average of 70.0 computed from many samples equals 70.
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        let tolerance = EQUALITY_TOLERANCE * threshold.abs().max(1.0);
        match self {
            ComparisonOperator::GreaterThan => observed > threshold,
            ComparisonOperator::GreaterThanOrEqual => observed >= threshold,
            ComparisonOperator::LessThan => observed < threshold,
            ComparisonOperator::LessThanOrEqual => observed <= threshold,
            ComparisonOperator::Equal => (observed - threshold).abs() <= tolerance,
            ComparisonOperator::NotEqual => (observed - threshold).abs() > tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: ThresholdMetric,
    pub operator: ComparisonOperator,
    pub value: f64,
    /// Window length in seconds; accepts `300`, `"300s"`, `"5m"`, `"1h"`, `"1d"`.
    #[serde(rename = "time_window", deserialize_with = "deserialize_window")]
    pub time_window_secs: u64,
    #[serde(default)]
    pub min_requests: u64,
}

fn default_true() -> bool {
    true
}

/// Alert rule as stored by the rule store (JSON wire shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AlertRuleDefinition {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub rule_type: AlertRuleKind,
    pub severity: Severity,
    #[serde(default)]
    pub threshold_config: Option<ThresholdConfig>,
    #[serde(default)]
    pub detection_rule_ids: Vec<String>,
    #[serde(default)]
    pub notifications: NotificationTargets,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Pending,
    /// Claimed by a scheduler; notifications may be in flight.
    Firing,
    Fired,
    Cancelled,
}

/// Durable "due at" record for a critical alert awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub alert_id: String,
    pub due_at: DateTime<Utc>,
    pub state: EscalationState,
    pub updated_at: DateTime<Utc>,
    /// While `Firing`: when the claim expires and the record may be fired again.
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn pending(alert_id: impl Into<String>, due_at: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        Self { alert_id: alert_id.into(), due_at, state: EscalationState::Pending, updated_at: at, lease_until: None }
    }

    /// Whether a scheduler may claim this record at `now`: pending and due, or
    /// firing under an expired lease.
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            EscalationState::Pending => self.due_at <= now,
            EscalationState::Firing => self.lease_until.map_or(true, |l| l <= now),
            EscalationState::Fired | EscalationState::Cancelled => false,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self.state, EscalationState::Pending | EscalationState::Firing)
    }
}

/// Parse `"90"`, `"90s"`, `"5m"`, `"2h"`, `"1d"` into seconds.
pub fn parse_window_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let mult = match unit.trim() {
        "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86_400,
        _ => return None,
    };
    n.checked_mul(mult)
}

fn deserialize_window<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Secs(n) => Ok(n),
        Raw::Text(s) => parse_window_secs(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time window '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_units() {
        assert_eq!(parse_window_secs("300"), Some(300));
        assert_eq!(parse_window_secs("45s"), Some(45));
        assert_eq!(parse_window_secs("5m"), Some(300));
        assert_eq!(parse_window_secs("2h"), Some(7200));
        assert_eq!(parse_window_secs("1d"), Some(86_400));
        assert_eq!(parse_window_secs("5w"), None);
        assert_eq!(parse_window_secs(""), None);
    }

    #[test]
    fn decodes_threshold_alert_rule() {
        let raw = serde_json::json!({
            "name": "Sustained high risk",
            "rule_type": "threshold",
            "severity": "high",
            "threshold_config": {
                "metric": "avg_risk_score",
                "operator": "greater_than",
                "value": 70,
                "time_window": "5m",
                "min_requests": 10
            },
            "notifications": {"webhook": {"url": "https://ir.example/hook"}}
        });
        let rule: AlertRuleDefinition = serde_json::from_value(raw).unwrap();
        let cfg = rule.threshold_config.unwrap();
        assert_eq!(cfg.time_window_secs, 300);
        assert_eq!(cfg.operator, ComparisonOperator::GreaterThan);
        assert!(rule.is_active);
    }

    #[test]
    fn equality_tolerates_rounding_at_score_scale() {
        let avg = [70.1, 69.9, 70.2, 69.8, 70.0].iter().sum::<f64>() / 5.0;
        assert!(ComparisonOperator::Equal.compare(avg, 70.0));
        assert!(!ComparisonOperator::NotEqual.compare(avg, 70.0));
        assert!(!ComparisonOperator::Equal.compare(70.01, 70.0));
        let ratio = (0..10).map(|_| 0.1).sum::<f64>();
        assert!(ComparisonOperator::Equal.compare(ratio, 1.0));
    }

    #[test]
    fn operator_symbols_are_accepted() {
        let op: ComparisonOperator = serde_json::from_value(serde_json::json!(">=")).unwrap();
        assert_eq!(op, ComparisonOperator::GreaterThanOrEqual);
        assert!(op.compare(70.0, 70.0));
        assert!(!ComparisonOperator::GreaterThan.compare(70.0, 70.0));
    }
}
