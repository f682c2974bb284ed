use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    AlertFilter, AlertStore, AssessmentStore, EscalationStore, IdempotencyStore, NotificationLog, RuleSnapshotStore,
    SessionStore,
};
use crate::error::{PipelineError, Result};
use crate::models::{
    Alert, EscalationRecord, EscalationState, NotificationAttempt, RiskAssessment, SessionState,
};
use crate::rules::PublishReport;

#[derive(Default)]
struct Tables {
    snapshots: Vec<(String, PublishReport)>,
    assessments: HashMap<String, RiskAssessment>,
    sessions: HashMap<String, SessionState>,
    alerts: HashMap<String, Alert>,
    escalations: HashMap<String, EscalationRecord>,
    attempts: Vec<NotificationAttempt>,
    keys: HashSet<String>,
}

/// In-process store. All tables sit behind one mutex, so every trait call is
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    alert_writes_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a storage error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only alert writes, leaving reads and the other tables working.
    pub fn set_alert_writes_failing(&self, failing: bool) {
        self.alert_writes_failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PipelineError::storage("store unavailable"))
        } else {
            Ok(())
        }
    }

    pub fn alert_count(&self) -> usize {
        self.tables.lock().alerts.len()
    }

    pub fn assessment_count(&self) -> usize {
        self.tables.lock().assessments.len()
    }

    pub fn snapshot_history(&self) -> Vec<(String, u64)> {
        self.tables
            .lock()
            .snapshots
            .iter()
            .map(|(kind, r)| (kind.clone(), r.version))
            .collect()
    }
}

#[async_trait]
impl RuleSnapshotStore for MemoryStore {
    async fn record_snapshot(&self, kind: &str, report: &PublishReport) -> Result<()> {
        self.check()?;
        self.tables.lock().snapshots.push((kind.to_string(), report.clone()));
        Ok(())
    }
}

#[async_trait]
impl AssessmentStore for MemoryStore {
    async fn append_assessment(&self, assessment: &RiskAssessment) -> Result<bool> {
        self.check()?;
        let mut t = self.tables.lock();
        if t.assessments.contains_key(&assessment.event_id) {
            return Ok(false);
        }
        t.assessments.insert(assessment.event_id.clone(), assessment.clone());
        Ok(true)
    }

    async fn get_assessment(&self, event_id: &str) -> Result<Option<RiskAssessment>> {
        self.check()?;
        Ok(self.tables.lock().assessments.get(event_id).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_session(&self, session: &SessionState) -> Result<()> {
        self.check()?;
        self.tables.lock().sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn sessions_for(&self, source_address: &str) -> Result<Vec<SessionState>> {
        self.check()?;
        let mut out: Vec<SessionState> = self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| s.source_address == source_address)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.window_start);
        Ok(out)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        self.check()?;
        if self.alert_writes_failing.load(Ordering::SeqCst) {
            return Err(PipelineError::storage("alert write failed"));
        }
        self.tables.lock().alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        self.check()?;
        Ok(self.tables.lock().alerts.get(alert_id).cloned())
    }

    async fn find_unresolved(
        &self,
        source_address: Option<&str>,
        alert_rule: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        self.check()?;
        let t = self.tables.lock();
        Ok(t.alerts
            .values()
            .filter(|a| {
                a.is_unresolved()
                    && a.alert_rule.as_deref() == Some(alert_rule)
                    && a.source_address.as_deref() == source_address
                    && a.created_at >= since
            })
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.check()?;
        let mut out: Vec<Alert> = self
            .tables
            .lock()
            .alerts
            .values()
            .filter(|a| filter.accepts(a))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

#[async_trait]
impl EscalationStore for MemoryStore {
    async fn upsert_escalation(&self, record: &EscalationRecord) -> Result<()> {
        self.check()?;
        self.tables.lock().escalations.insert(record.alert_id.clone(), record.clone());
        Ok(())
    }

    async fn get_escalation(&self, alert_id: &str) -> Result<Option<EscalationRecord>> {
        self.check()?;
        Ok(self.tables.lock().escalations.get(alert_id).cloned())
    }

    async fn due_escalations(&self, now: DateTime<Utc>) -> Result<Vec<EscalationRecord>> {
        self.check()?;
        let mut out: Vec<EscalationRecord> = self
            .tables
            .lock()
            .escalations
            .values()
            .filter(|r| r.claimable(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.alert_id.cmp(&b.alert_id)));
        Ok(out)
    }

    async fn pending_escalations(&self) -> Result<Vec<EscalationRecord>> {
        self.check()?;
        let mut out: Vec<EscalationRecord> = self
            .tables
            .lock()
            .escalations
            .values()
            .filter(|r| r.is_outstanding())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        Ok(out)
    }

    async fn claim_escalation(
        &self,
        alert_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        let mut t = self.tables.lock();
        match t.escalations.get_mut(alert_id) {
            Some(rec) if rec.claimable(now) => {
                rec.state = EscalationState::Firing;
                rec.updated_at = now;
                rec.lease_until = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_escalation(
        &self,
        alert_id: &str,
        from: EscalationState,
        to: EscalationState,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        let mut t = self.tables.lock();
        match t.escalations.get_mut(alert_id) {
            Some(rec) if rec.state == from => {
                rec.state = to;
                rec.updated_at = at;
                if to != EscalationState::Firing {
                    rec.lease_until = None;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl NotificationLog for MemoryStore {
    async fn append_attempt(&self, attempt: &NotificationAttempt) -> Result<()> {
        self.check()?;
        self.tables.lock().attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts_for(&self, alert_id: &str) -> Result<Vec<NotificationAttempt>> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .attempts
            .iter()
            .filter(|a| a.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn claim_key(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.tables.lock().keys.insert(key.to_string()))
    }

    async fn release_key(&self, key: &str) -> Result<()> {
        self.check()?;
        self.tables.lock().keys.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSourceKind, AlertStatus, Severity};
    use chrono::Duration;

    fn alert(id: &str, rule: &str, source: &str, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: id.to_string(),
            title: "t".to_string(),
            severity: Severity::High,
            status: AlertStatus::New,
            source_kind: AlertSourceKind::DetectionRule,
            alert_rule: Some(rule.to_string()),
            source_address: Some(source.to_string()),
            event_id: None,
            metadata: Default::default(),
            created_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    #[tokio::test]
    async fn claim_key_is_insert_if_absent() {
        let store = MemoryStore::new();
        assert!(store.claim_key("k").await.unwrap());
        assert!(!store.claim_key("k").await.unwrap());
        store.release_key("k").await.unwrap();
        assert!(store.claim_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn find_unresolved_respects_scope_and_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_alert(&alert("a1", "r", "10.0.0.1", now - Duration::minutes(90))).await.unwrap();
        store.upsert_alert(&alert("a2", "r", "10.0.0.1", now - Duration::minutes(10))).await.unwrap();
        store.upsert_alert(&alert("a3", "r", "10.0.0.2", now)).await.unwrap();
        let since = now - Duration::hours(1);
        let hit = store.find_unresolved(Some("10.0.0.1"), "r", since).await.unwrap();
        assert_eq!(hit.map(|a| a.id), Some("a2".to_string()));
        assert!(store.find_unresolved(Some("10.0.0.1"), "other", since).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn escalation_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_escalation(&EscalationRecord::pending("a", now, now))
            .await
            .unwrap();
        assert!(store.transition_escalation("a", EscalationState::Pending, EscalationState::Fired, now).await.unwrap());
        assert!(!store.transition_escalation("a", EscalationState::Pending, EscalationState::Fired, now).await.unwrap());
        assert!(store.due_escalations(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn firing_claim_expires_with_its_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_escalation(&EscalationRecord::pending("a", now, now)).await.unwrap();
        let lease = now + Duration::minutes(5);
        assert!(store.claim_escalation("a", now, lease).await.unwrap());
        assert!(!store.claim_escalation("a", now + Duration::minutes(1), lease).await.unwrap());
        assert!(store.due_escalations(now + Duration::minutes(1)).await.unwrap().is_empty());
        assert_eq!(store.pending_escalations().await.unwrap().len(), 1);

        let later = now + Duration::minutes(6);
        assert_eq!(store.due_escalations(later).await.unwrap().len(), 1);
        assert!(store.claim_escalation("a", later, later + Duration::minutes(5)).await.unwrap());
        assert!(store.transition_escalation("a", EscalationState::Firing, EscalationState::Fired, later).await.unwrap());
        let rec = store.get_escalation("a").await.unwrap().unwrap();
        assert_eq!(rec.state, EscalationState::Fired);
        assert!(rec.lease_until.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.claim_key("k").await.is_err());
        store.set_unavailable(false);
        assert!(store.claim_key("k").await.is_ok());
    }
}
