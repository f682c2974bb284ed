use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Points awarded by one matching rule during one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssessmentOutcome {
    Assessed,
    Unassessable { missing: Vec<String> },
}

/// Scored verdict for a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub event_id: String,
    pub source_address: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Clamped to [0, 100].
    pub score: u32,
    pub flagged: bool,
    /// Matched rule names in evaluation order.
    pub flag_reason: Vec<String>,
    pub matches: Vec<RuleMatch>,
    pub outcome: AssessmentOutcome,
    pub snapshot_version: u64,
}

impl RiskAssessment {
    pub fn is_assessed(&self) -> bool {
        matches!(self.outcome, AssessmentOutcome::Assessed)
    }

    pub fn matched(&self, rule: &str) -> bool {
        self.flag_reason.iter().any(|r| r == rule)
    }
}
