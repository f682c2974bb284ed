//! Rule compilation and versioned snapshots.
//!
//! Definitions arrive as data from the rule store. Each publish compiles the
//! whole set, drops the entries that fail validation or compilation, and swaps
//! in a new immutable snapshot. Evaluations hold an `Arc` to the snapshot they
//! started with, so a publish never changes a rule set mid-evaluation.

pub mod expr;
pub mod matcher;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::models::{
    AlertRuleDefinition, AlertRuleKind, ChannelTarget, Category, CombinationLogic, Event, RuleDefinition,
    RuleKind, Severity, ThresholdConfig,
};
use expr::ScoringExpr;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Keyword { terms: Vec<String>, logic: CombinationLogic },
    Regex(Regex),
    ModelRestriction(BTreeSet<String>),
    CustomScoring(ScoringExpr),
}

impl RuleMatcher {
    fn compile(def: &RuleDefinition) -> std::result::Result<Self, String> {
        match def.rule_type {
            RuleKind::Keyword => {
                let terms = matcher::split_alternatives(&def.pattern);
                if terms.is_empty() {
                    return Err("keyword pattern has no alternatives".to_string());
                }
                Ok(RuleMatcher::Keyword { terms, logic: def.combination_logic })
            }
            RuleKind::Regex => RegexBuilder::new(&def.pattern)
                .case_insensitive(true)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map(RuleMatcher::Regex)
                .map_err(|e| format!("invalid regular expression: {}", e)),
            RuleKind::ModelRestriction => {
                let set = matcher::split_identifiers(&def.pattern);
                if set.is_empty() {
                    return Err("model restriction lists no identifiers".to_string());
                }
                Ok(RuleMatcher::ModelRestriction(set))
            }
            RuleKind::CustomScoring => ScoringExpr::parse(&def.pattern)
                .map(RuleMatcher::CustomScoring)
                .map_err(|e| format!("invalid scoring expression: {}", e)),
        }
    }

    /// `text_lower` is the lowercased prompt + response haystack.
    pub fn matches(&self, event: &Event, text: &str, text_lower: &str) -> bool {
        match self {
            RuleMatcher::Keyword { terms, logic } => matcher::keyword_match(text_lower, terms, *logic),
            RuleMatcher::Regex(re) => re.is_match(text),
            RuleMatcher::ModelRestriction(set) => {
                matcher::identifier_match(set, event.model.as_deref(), event.provider.as_deref())
            }
            RuleMatcher::CustomScoring(expr) => expr.evaluate(event),
        }
    }
}

/// A detection rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub category: Category,
    pub kind: RuleKind,
    pub severity: Severity,
    pub points: u32,
    pub priority: i32,
    pub stop_on_match: bool,
    pub matcher: RuleMatcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRejection {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub version: u64,
    pub accepted: usize,
    pub rejected: Vec<RuleRejection>,
    pub warnings: Vec<String>,
}

/// Immutable, ordered set of active detection rules.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub version: u64,
    rules: Vec<CompiledRule>,
}

impl RuleSnapshot {
    /// Rules in evaluation order: priority descending, then name ascending.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

fn reject(report: &mut PublishReport, rule: &str, kind: &str, reason: String) {
    warn!(rule = %rule, reason = %reason, "rule excluded from snapshot");
    metrics::inc_rules_rejected(kind);
    report.rejected.push(RuleRejection { rule: rule.to_string(), reason });
}

fn validation_message(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .keys()
        .map(|field| format!("invalid {}", field))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compile a batch of detection rules into a snapshot.
///
/// Inactive rules are skipped without being reported and do not reserve their
/// name. Among active definitions, duplicate names keep the first one.
pub fn compile_rules(defs: Vec<RuleDefinition>, version: u64) -> (RuleSnapshot, PublishReport) {
    let mut report = PublishReport { version, ..Default::default() };
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(defs.len());
    for def in defs {
        if let Err(e) = def.validate() {
            reject(&mut report, &def.name, "invalid", validation_message(e));
            continue;
        }
        if !def.is_active {
            continue;
        }
        if !seen.insert(def.name.clone()) {
            reject(&mut report, &def.name, "duplicate", "duplicate rule name".to_string());
            continue;
        }
        match RuleMatcher::compile(&def) {
            Ok(matcher) => rules.push(CompiledRule {
                name: def.name,
                category: def.category,
                kind: def.rule_type,
                severity: def.severity,
                points: def.points,
                priority: def.priority,
                stop_on_match: def.stop_on_match,
                matcher,
            }),
            Err(reason) => reject(&mut report, &def.name, "compile", reason),
        }
    }
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    report.accepted = rules.len();
    (RuleSnapshot { version, rules }, report)
}

/// Alert rule with its notification targets resolved.
#[derive(Debug, Clone)]
pub struct CompiledAlertRule {
    pub name: String,
    pub kind: AlertRuleKind,
    pub severity: Severity,
    pub threshold: Option<ThresholdConfig>,
    pub detection_rules: BTreeSet<String>,
    pub channels: Vec<ChannelTarget>,
}

impl CompiledAlertRule {
    pub fn triggered_by(&self, matched: &[String]) -> bool {
        matched.iter().any(|m| self.detection_rules.contains(m))
    }
}

#[derive(Debug, Default)]
pub struct AlertRuleSet {
    pub version: u64,
    rules: Vec<CompiledAlertRule>,
}

impl AlertRuleSet {
    pub fn rules(&self) -> &[CompiledAlertRule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&CompiledAlertRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn detection_rules(&self) -> impl Iterator<Item = &CompiledAlertRule> {
        self.rules.iter().filter(|r| r.kind == AlertRuleKind::DetectionRule)
    }

    pub fn threshold_rules(&self) -> impl Iterator<Item = &CompiledAlertRule> {
        self.rules.iter().filter(|r| r.kind == AlertRuleKind::Threshold)
    }
}

pub fn compile_alert_rules(defs: Vec<AlertRuleDefinition>, version: u64) -> (AlertRuleSet, PublishReport) {
    let mut report = PublishReport { version, ..Default::default() };
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(defs.len());
    for def in defs {
        if let Err(e) = def.validate() {
            reject(&mut report, &def.name, "invalid", validation_message(e));
            continue;
        }
        if !def.is_active {
            continue;
        }
        if !seen.insert(def.name.clone()) {
            reject(&mut report, &def.name, "duplicate", "duplicate alert rule name".to_string());
            continue;
        }
        let threshold = match def.rule_type {
            AlertRuleKind::Threshold => match &def.threshold_config {
                Some(cfg) if cfg.time_window_secs > 0 => Some(cfg.clone()),
                Some(_) => {
                    reject(&mut report, &def.name, "invalid", "time_window must be positive".to_string());
                    continue;
                }
                None => {
                    reject(&mut report, &def.name, "invalid", "threshold rule without threshold_config".to_string());
                    continue;
                }
            },
            AlertRuleKind::DetectionRule => {
                if def.detection_rule_ids.is_empty() {
                    reject(&mut report, &def.name, "invalid", "detection_rule_ids is empty".to_string());
                    continue;
                }
                None
            }
        };
        let (channels, warnings) = def.notifications.resolve(&def.name);
        for w in &warnings {
            warn!(rule = %def.name, "{}", w);
        }
        report.warnings.extend(warnings);
        rules.push(CompiledAlertRule {
            name: def.name,
            kind: def.rule_type,
            severity: def.severity,
            threshold,
            detection_rules: def.detection_rule_ids.into_iter().collect(),
            channels: channels.into_iter().filter(|c| c.config.enabled()).collect(),
        });
    }
    rules.sort_by(|a, b| a.name.cmp(&b.name));
    report.accepted = rules.len();
    (AlertRuleSet { version, rules }, report)
}

/// Decode each raw definition independently so one malformed entry does not
/// sink the batch.
fn decode_each<T: serde::de::DeserializeOwned>(raw: Vec<serde_json::Value>, report: &mut Vec<RuleRejection>) -> Vec<T> {
    let mut out = Vec::with_capacity(raw.len());
    for value in raw {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("<unnamed>")
            .to_string();
        match serde_json::from_value::<T>(value) {
            Ok(def) => out.push(def),
            Err(e) => {
                warn!(rule = %name, error = %e, "rule definition failed to decode");
                metrics::inc_rules_rejected("decode");
                report.push(RuleRejection { rule: name, reason: format!("decode: {}", e) });
            }
        }
    }
    out
}

/// Holder for the current detection and alert rule snapshots.
pub struct RuleRegistry {
    detection: RwLock<Arc<RuleSnapshot>>,
    alerts: RwLock<Arc<AlertRuleSet>>,
    version: AtomicU64,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            detection: RwLock::new(Arc::new(RuleSnapshot::default())),
            alerts: RwLock::new(Arc::new(AlertRuleSet::default())),
            version: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Arc<RuleSnapshot> {
        self.detection.read().clone()
    }

    pub fn alert_rules(&self) -> Arc<AlertRuleSet> {
        self.alerts.read().clone()
    }

    pub fn publish(&self, defs: Vec<RuleDefinition>) -> PublishReport {
        let (snapshot, report) = compile_rules(defs, self.next_version());
        info!(
            version = report.version,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            "published detection rule snapshot"
        );
        *self.detection.write() = Arc::new(snapshot);
        report
    }

    pub fn publish_json(&self, raw: Vec<serde_json::Value>) -> PublishReport {
        let mut decode_rejections = Vec::new();
        let defs = decode_each::<RuleDefinition>(raw, &mut decode_rejections);
        let mut report = self.publish(defs);
        report.rejected.splice(0..0, decode_rejections);
        report
    }

    pub fn publish_alert_rules(&self, defs: Vec<AlertRuleDefinition>) -> PublishReport {
        let (set, report) = compile_alert_rules(defs, self.next_version());
        info!(
            version = report.version,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            "published alert rule set"
        );
        *self.alerts.write() = Arc::new(set);
        report
    }

    pub fn publish_alert_rules_json(&self, raw: Vec<serde_json::Value>) -> PublishReport {
        let mut decode_rejections = Vec::new();
        let defs = decode_each::<AlertRuleDefinition>(raw, &mut decode_rejections);
        let mut report = self.publish_alert_rules(defs);
        report.rejected.splice(0..0, decode_rejections);
        report
    }
}

/// Read a JSON array of definitions from disk without decoding entries.
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<serde_json::Value>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::config(format!("failed to read {}: {}", path.display(), e)))?;
    match serde_json::from_str::<serde_json::Value>(&content)? {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut obj) => match obj.remove("rules") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(PipelineError::parsing(format!(
                "{}: expected an array of definitions or {{\"rules\": [...]}}",
                path.display()
            ))),
        },
        _ => Err(PipelineError::parsing(format!("{}: expected an array of definitions", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(name: &str, pattern: &str, points: u32, priority: i32) -> RuleDefinition {
        RuleDefinition::new(name, RuleKind::Keyword, pattern, points).with_priority(priority)
    }

    #[test]
    fn snapshot_orders_by_priority_then_name() {
        let registry = RuleRegistry::new();
        let report = registry.publish(vec![
            kw("b", "x", 1, 10),
            kw("a", "x", 1, 10),
            kw("c", "x", 1, 50),
            kw("d", "x", 1, -1),
        ]);
        assert_eq!(report.accepted, 4);
        let names: Vec<_> = registry.current().rules().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn bad_rules_are_excluded_and_reported() {
        let registry = RuleRegistry::new();
        let report = registry.publish(vec![
            RuleDefinition::new("bad regex", RuleKind::Regex, "([a-z", 10),
            RuleDefinition::new("bad expr", RuleKind::CustomScoring, "import os", 10),
            RuleDefinition::new("too many points", RuleKind::Keyword, "x", 101),
            kw("good", "secret", 10, 0),
            kw("good", "other", 10, 0),
            kw("off", "x", 10, 0).inactive(),
        ]);
        assert_eq!(report.accepted, 1);
        let rejected: Vec<_> = report.rejected.iter().map(|r| r.rule.as_str()).collect();
        assert_eq!(rejected, vec!["bad regex", "bad expr", "too many points", "good"]);
        assert_eq!(registry.current().len(), 1);
        assert!(registry.current().get("good").is_some());
    }

    #[test]
    fn inactive_definition_does_not_shadow_active_one() {
        let registry = RuleRegistry::new();
        let report = registry.publish(vec![kw("secrets", "old", 10, 0).inactive(), kw("secrets", "password", 40, 0)]);
        assert_eq!(report.accepted, 1);
        assert!(report.rejected.is_empty());
        assert_eq!(registry.current().get("secrets").map(|r| r.points), Some(40));
    }

    #[test]
    fn publish_swaps_snapshot_without_touching_held_ones() {
        let registry = RuleRegistry::new();
        registry.publish(vec![kw("one", "x", 1, 0)]);
        let held = registry.current();
        registry.publish(vec![kw("two", "x", 1, 0), kw("three", "y", 1, 0)]);
        assert_eq!(held.len(), 1);
        assert_eq!(registry.current().len(), 2);
        assert!(registry.current().version > held.version);
    }

    #[test]
    fn json_publish_reports_decode_failures() {
        let registry = RuleRegistry::new();
        let report = registry.publish_json(vec![
            serde_json::json!({"name": "ok", "category": "security", "rule_type": "keyword", "pattern": "x", "severity": "low", "points": 5}),
            serde_json::json!({"name": "lua", "category": "security", "rule_type": "lua", "pattern": "x", "severity": "low", "points": 5}),
        ]);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].rule, "lua");
    }

    #[test]
    fn alert_rules_require_kind_specific_config() {
        let registry = RuleRegistry::new();
        let report = registry.publish_alert_rules_json(vec![
            serde_json::json!({"name": "no cfg", "rule_type": "threshold", "severity": "high"}),
            serde_json::json!({"name": "no ids", "rule_type": "detection_rule", "severity": "high"}),
            serde_json::json!({
                "name": "keywords", "rule_type": "detection_rule", "severity": "critical",
                "detection_rule_ids": ["Critical Keywords"],
                "notifications": {"slack": {"channel": "#no-url"}, "webhook": {"url": "https://ir.example/h"}}
            }),
        ]);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        let set = registry.alert_rules();
        let rule = set.get("keywords").unwrap();
        assert_eq!(rule.channels.len(), 1);
        assert!(rule.triggered_by(&["Critical Keywords".to_string()]));
        assert!(!rule.triggered_by(&["Other".to_string()]));
    }

    #[test]
    fn inactive_alert_rule_does_not_reserve_its_name() {
        let registry = RuleRegistry::new();
        let report = registry.publish_alert_rules_json(vec![
            serde_json::json!({
                "name": "keywords", "rule_type": "detection_rule", "severity": "low",
                "detection_rule_ids": ["Old"], "is_active": false
            }),
            serde_json::json!({
                "name": "keywords", "rule_type": "detection_rule", "severity": "critical",
                "detection_rule_ids": ["Critical Keywords"]
            }),
        ]);
        assert_eq!(report.accepted, 1);
        assert!(report.rejected.is_empty());
        assert_eq!(registry.alert_rules().get("keywords").map(|r| r.severity), Some(Severity::Critical));
    }

    #[test]
    fn loads_definitions_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"rules": [{"name": "a"}, {"name": "b"}]}"#).unwrap();
        assert_eq!(load_definitions(&path).unwrap().len(), 2);
        std::fs::write(&path, r#""nope""#).unwrap();
        assert!(load_definitions(&path).is_err());
    }
}
