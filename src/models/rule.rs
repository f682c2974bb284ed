use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DataPrivacy,
    Security,
    Compliance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Keyword,
    Regex,
    ModelRestriction,
    CustomScoring,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Keyword => "keyword",
            RuleKind::Regex => "regex",
            RuleKind::ModelRestriction => "model_restriction",
            RuleKind::CustomScoring => "custom_scoring",
        }
    }
}

/// Ordered low to high so `max()` gives the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[serde(alias = "LOW")]
    Low,
    #[serde(alias = "MEDIUM")]
    Medium,
    #[serde(alias = "HIGH")]
    High,
    #[serde(alias = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CombinationLogic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[default]
    #[serde(rename = "OR", alias = "or")]
    Or,
}

fn default_true() -> bool {
    true
}

/// Detection rule as stored by the rule store (JSON wire shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RuleDefinition {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    pub rule_type: RuleKind,
    #[validate(length(min = 1))]
    pub pattern: String,
    pub severity: Severity,
    #[validate(range(min = 0, max = 100))]
    pub points: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub stop_on_match: bool,
    #[serde(default)]
    pub combination_logic: CombinationLogic,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>, rule_type: RuleKind, pattern: impl Into<String>, points: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: Category::Security,
            rule_type,
            pattern: pattern.into(),
            severity: Severity::Medium,
            points,
            priority: 0,
            stop_on_match: false,
            combination_logic: CombinationLogic::Or,
            is_active: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stop_on_match(mut self, stop: bool) -> Self {
        self.stop_on_match = stop;
        self
    }

    pub fn with_logic(mut self, logic: CombinationLogic) -> Self {
        self.combination_logic = logic;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}
