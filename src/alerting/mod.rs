//! Alert generation, suppression and lifecycle.
//!
//! Candidates come from two places: detection-rule alert rules fire on flagged
//! assessments whose matched rules intersect their trigger set, and threshold
//! alert rules fire when their sliding window satisfies the comparison.
//! Every candidate then goes through the same path:
//!
//! 1. replay guard: a trigger key claimed once per (alert rule, source, event)
//! 2. suppression: an unresolved alert for the same (source, alert rule)
//!    created inside the suppression window absorbs the candidate as a duplicate
//! 3. creation, plus an escalation record for critical alerts
//!
//! Store failures in steps 1 and 2 fail open: a duplicate alert is preferred
//! over a lost one. When the write in step 3 fails, the trigger key is released
//! and the error is returned, so the caller can run the event again.

pub mod escalation;
pub mod threshold;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AlertingConfig;
use crate::error::{PipelineError, Result};
use crate::keylock::KeyedLocks;
use crate::metrics;
use crate::models::{
    Alert, AlertSourceKind, AlertStatus, EscalationRecord, EscalationState, RiskAssessment, SessionState, Severity,
};
use crate::rules::{AlertRuleSet, CompiledAlertRule};
use crate::store::Store;
use threshold::ThresholdWindows;

/// An alert about to be raised.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub title: String,
    pub severity: Severity,
    pub source_kind: AlertSourceKind,
    /// Suppression scope together with the source address.
    pub alert_rule: String,
    pub source_address: Option<String>,
    pub event_id: Option<String>,
    pub metadata: Map<String, Value>,
    /// Replay guard; `None` for candidates that are not tied to an event.
    pub trigger_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    Created(Alert),
    /// Merged into this existing alert.
    Suppressed(Alert),
    /// Same trigger seen before; nothing written.
    Replayed,
}

impl Raised {
    pub fn created(&self) -> Option<&Alert> {
        match self {
            Raised::Created(a) => Some(a),
            _ => None,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Raised::Created(_) => "created",
            Raised::Suppressed(_) => "suppressed",
            Raised::Replayed => "replayed",
        }
    }
}

/// Alerts raised for one assessment.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub raised: Vec<Raised>,
    /// First candidate that could not be written. Its trigger key has been
    /// released, so evaluating the same assessment again retries it.
    pub error: Option<PipelineError>,
}

impl Evaluation {
    pub fn created(&self) -> impl Iterator<Item = &Alert> {
        self.raised.iter().filter_map(Raised::created)
    }
}

/// Deterministic key for one trigger of one alert rule.
pub fn trigger_key(alert_rule: &str, source: &str, event_id: &str) -> String {
    let material = format!("{}|{}|{}", alert_rule, source, event_id);
    blake3::hash(material.as_bytes()).to_hex().to_string()
}

fn session_context(metadata: &mut Map<String, Value>, session: Option<&SessionState>) {
    if let Some(s) = session {
        metadata.insert("session_id".into(), json!(s.session_id));
        metadata.insert("session_risk_level".into(), json!(s.risk_level.as_str()));
        metadata.insert("session_request_count".into(), json!(s.request_count));
        if !s.anomalous_patterns.is_empty() {
            metadata.insert("anomalous_patterns".into(), json!(s.anomalous_patterns));
        }
    }
}

pub struct AlertEngine {
    config: AlertingConfig,
    store: Arc<dyn Store>,
    windows: ThresholdWindows,
    locks: KeyedLocks,
}

impl AlertEngine {
    pub fn new(config: AlertingConfig, store: Arc<dyn Store>) -> Self {
        let windows = ThresholdWindows::new(config.max_window_samples);
        Self { config, store, windows, locks: KeyedLocks::new() }
    }

    pub fn config(&self) -> &AlertingConfig {
        &self.config
    }

    pub fn windows(&self) -> &ThresholdWindows {
        &self.windows
    }

    fn detection_candidate(
        rule: &CompiledAlertRule,
        assessment: &RiskAssessment,
        source: &str,
        session: Option<&SessionState>,
    ) -> AlertCandidate {
        let matched: Vec<String> = assessment
            .flag_reason
            .iter()
            .filter(|r| rule.detection_rules.contains(*r))
            .cloned()
            .collect();
        let mut metadata = Map::new();
        metadata.insert("matched_rules".into(), json!(matched));
        metadata.insert("flag_reason".into(), json!(assessment.flag_reason));
        metadata.insert("score".into(), json!(assessment.score));
        metadata.insert("event_timestamp".into(), json!(assessment.timestamp));
        metadata.insert("provider".into(), json!(assessment.provider));
        metadata.insert("model".into(), json!(assessment.model));
        session_context(&mut metadata, session);
        AlertCandidate {
            title: format!("{}: {} matched for {}", rule.name, matched.join(", "), source),
            severity: rule.severity,
            source_kind: AlertSourceKind::DetectionRule,
            alert_rule: rule.name.clone(),
            source_address: Some(source.to_string()),
            event_id: Some(assessment.event_id.clone()),
            metadata,
            trigger_key: Some(trigger_key(&rule.name, source, &assessment.event_id)),
        }
    }

    fn threshold_candidate(
        &self,
        rule: &CompiledAlertRule,
        assessment: &RiskAssessment,
        source: &str,
        session: Option<&SessionState>,
    ) -> Option<AlertCandidate> {
        let cfg = rule.threshold.as_ref()?;
        let reading = self.windows.observe(&rule.name, cfg, source, assessment);
        if !reading.satisfied {
            return None;
        }
        let mut metadata = Map::new();
        metadata.insert("metric".into(), json!(cfg.metric.as_str()));
        metadata.insert("operator".into(), json!(cfg.operator.symbol()));
        metadata.insert("threshold".into(), json!(cfg.value));
        metadata.insert("observed_value".into(), json!(reading.value));
        metadata.insert("sample_count".into(), json!(reading.samples));
        metadata.insert("time_window_secs".into(), json!(cfg.time_window_secs));
        metadata.insert("event_timestamp".into(), json!(assessment.timestamp));
        session_context(&mut metadata, session);
        Some(AlertCandidate {
            title: format!(
                "{}: {} {} {} over {}s for {}",
                rule.name,
                cfg.metric.as_str(),
                cfg.operator.symbol(),
                cfg.value,
                cfg.time_window_secs,
                source
            ),
            severity: rule.severity,
            source_kind: AlertSourceKind::Threshold,
            alert_rule: rule.name.clone(),
            source_address: Some(source.to_string()),
            event_id: Some(assessment.event_id.clone()),
            metadata,
            trigger_key: Some(trigger_key(&rule.name, source, &assessment.event_id)),
        })
    }

    /// Run every alert rule against one assessment.
    ///
    /// Unassessable assessments and sourceless ones never produce alerts.
    /// A failed candidate does not stop the remaining rules; the first failure
    /// is kept in `Evaluation::error`.
    pub async fn evaluate(
        &self,
        assessment: &RiskAssessment,
        session: Option<&SessionState>,
        rules: &AlertRuleSet,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let source = match assessment.source_address.as_deref() {
            Some(s) if assessment.is_assessed() => s,
            _ => return Evaluation::default(),
        };

        let mut candidates = Vec::new();
        if assessment.flagged {
            for rule in rules.detection_rules().filter(|r| r.triggered_by(&assessment.flag_reason)) {
                candidates.push(Self::detection_candidate(rule, assessment, source, session));
            }
        }
        for rule in rules.threshold_rules() {
            if let Some(c) = self.threshold_candidate(rule, assessment, source, session) {
                candidates.push(c);
            }
        }

        let mut out = Evaluation { raised: Vec::with_capacity(candidates.len()), error: None };
        for candidate in candidates {
            let kind = candidate.source_kind.as_str();
            match self.raise(candidate, now).await {
                Ok(r) => out.raised.push(r),
                Err(e) => {
                    error!(source = %source, event_id = %assessment.event_id, error = %e, "failed to raise alert");
                    metrics::inc_alerts(kind, "error");
                    out.error.get_or_insert(e);
                }
            }
        }
        out
    }

    /// Pass a candidate through replay guard, suppression and creation.
    pub async fn raise(&self, candidate: AlertCandidate, now: DateTime<Utc>) -> Result<Raised> {
        let kind = candidate.source_kind.as_str();
        let scope = format!("{}|{}", candidate.alert_rule, candidate.source_address.as_deref().unwrap_or(""));
        let _guard = self.locks.lock(&scope).await;

        let mut claimed = None;
        if let Some(key) = &candidate.trigger_key {
            match self.store.claim_key(key).await {
                Ok(true) => claimed = Some(key.clone()),
                Ok(false) => {
                    debug!(rule = %candidate.alert_rule, "alert trigger already processed");
                    metrics::inc_alerts(kind, "replayed");
                    return Ok(Raised::Replayed);
                }
                Err(e) => warn!(rule = %candidate.alert_rule, error = %e, "idempotency check unavailable; continuing"),
            }
        }

        let since = now - self.config.suppression_window();
        match self
            .store
            .find_unresolved(candidate.source_address.as_deref(), &candidate.alert_rule, since)
            .await
        {
            Ok(Some(mut existing)) => {
                let count = existing.duplicate_count() + 1;
                existing.metadata.insert("duplicate_count".into(), json!(count));
                existing.metadata.insert("last_duplicate_at".into(), json!(now));
                if let Some(event_id) = &candidate.event_id {
                    existing.metadata.insert("last_duplicate_event_id".into(), json!(event_id));
                }
                match self.store.upsert_alert(&existing).await {
                    Ok(()) => {
                        debug!(alert_id = %existing.id, duplicates = count, "alert suppressed as duplicate");
                        metrics::inc_alerts(kind, "suppressed");
                        return Ok(Raised::Suppressed(existing));
                    }
                    Err(e) => warn!(alert_id = %existing.id, error = %e, "failed to record duplicate; creating alert"),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(rule = %candidate.alert_rule, error = %e, "suppression lookup failed; creating alert"),
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            title: candidate.title,
            severity: candidate.severity,
            status: AlertStatus::New,
            source_kind: candidate.source_kind,
            alert_rule: Some(candidate.alert_rule),
            source_address: candidate.source_address,
            event_id: candidate.event_id,
            metadata: candidate.metadata,
            created_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        };
        if let Err(e) = self.store.upsert_alert(&alert).await {
            if let Some(key) = claimed {
                if let Err(release) = self.store.release_key(&key).await {
                    error!(rule = alert.alert_rule.as_deref().unwrap_or(""), error = %release, "failed to release trigger key");
                }
            }
            return Err(e);
        }
        info!(
            alert_id = %alert.id,
            rule = alert.alert_rule.as_deref().unwrap_or(""),
            source = alert.source_address.as_deref().unwrap_or(""),
            severity = alert.severity.as_str(),
            "alert created"
        );
        metrics::inc_alerts(kind, "created");

        if alert.severity == Severity::Critical {
            self.schedule_escalation(&alert).await;
        }
        Ok(Raised::Created(alert))
    }

    async fn schedule_escalation(&self, alert: &Alert) {
        let record = EscalationRecord::pending(&alert.id, alert.created_at + self.config.escalation_delay(), alert.created_at);
        match self.store.upsert_escalation(&record).await {
            Ok(()) => metrics::inc_escalations("scheduled"),
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "failed to persist escalation record");
                metrics::inc_escalations("schedule_failed");
            }
        }
    }

    /// Raise an alert about the pipeline itself. Suppressed like any other.
    pub async fn raise_system(
        &self,
        title: &str,
        severity: Severity,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Raised> {
        let candidate = AlertCandidate {
            title: title.to_string(),
            severity,
            source_kind: AlertSourceKind::System,
            alert_rule: format!("system:{}", title.to_lowercase().replace(' ', "_")),
            source_address: None,
            event_id: None,
            metadata,
            trigger_key: None,
        };
        self.raise(candidate, now).await
    }

    async fn load(&self, alert_id: &str) -> Result<Alert> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("alert '{}'", alert_id)))
    }

    async fn cancel_escalation(&self, alert_id: &str, now: DateTime<Utc>) {
        for from in [EscalationState::Pending, EscalationState::Firing] {
            match self.store.transition_escalation(alert_id, from, EscalationState::Cancelled, now).await {
                Ok(true) => {
                    metrics::inc_escalations("cancelled");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(alert_id = %alert_id, error = %e, "failed to cancel escalation; scheduler will re-check status");
                    return;
                }
            }
        }
    }

    /// `new -> acknowledged`. Acknowledging an acknowledged or resolved alert
    /// returns it unchanged.
    pub async fn acknowledge(&self, alert_id: &str, actor: &str, now: DateTime<Utc>) -> Result<Alert> {
        let _guard = self.locks.lock(&format!("alert|{}", alert_id)).await;
        let mut alert = self.load(alert_id).await?;
        if alert.status != AlertStatus::New {
            return Ok(alert);
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.acknowledged_by = Some(actor.to_string());
        self.store.upsert_alert(&alert).await?;
        self.cancel_escalation(alert_id, now).await;
        info!(alert_id = %alert_id, actor = %actor, "alert acknowledged");
        Ok(alert)
    }

    /// `-> resolved`. A new alert passes through acknowledged on the way, so
    /// the recorded history never skips a state. Resolving twice is a no-op.
    pub async fn resolve(&self, alert_id: &str, actor: &str, now: DateTime<Utc>) -> Result<Alert> {
        let _guard = self.locks.lock(&format!("alert|{}", alert_id)).await;
        let mut alert = self.load(alert_id).await?;
        match alert.status {
            AlertStatus::Resolved => return Ok(alert),
            AlertStatus::New => {
                alert.acknowledged_at = Some(now);
                alert.acknowledged_by = Some(actor.to_string());
            }
            AlertStatus::Acknowledged => {}
        }
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = Some(actor.to_string());
        self.store.upsert_alert(&alert).await?;
        self.cancel_escalation(alert_id, now).await;
        info!(alert_id = %alert_id, actor = %actor, "alert resolved");
        Ok(alert)
    }

    /// Mark an alert as escalated. Used by the scheduler after it has claimed
    /// the escalation record.
    pub(crate) async fn mark_escalated(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        let _guard = self.locks.lock(&format!("alert|{}", alert_id)).await;
        let mut alert = self.load(alert_id).await?;
        alert.metadata.insert("escalated".into(), json!(true));
        alert.metadata.insert("escalated_at".into(), json!(now));
        self.store.upsert_alert(&alert).await?;
        Ok(alert)
    }
}
