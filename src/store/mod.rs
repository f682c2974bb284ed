//! Storage traits for the records the pipeline persists.
//!
//! The relational store itself lives outside this crate. These traits name the
//! operations the pipeline needs from it; [`memory::MemoryStore`] implements
//! them in-process for the CLI and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    Alert, AlertStatus, EscalationRecord, EscalationState, NotificationAttempt, RiskAssessment, SessionState,
    Severity,
};
use crate::rules::PublishReport;

pub use memory::MemoryStore;

/// Filters accepted by alert listings. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn accepts(&self, alert: &Alert) -> bool {
        self.status.map_or(true, |s| alert.status == s) && self.severity.map_or(true, |s| alert.severity == s)
    }
}

/// Audit trail of published rule snapshots.
#[async_trait]
pub trait RuleSnapshotStore: Send + Sync {
    async fn record_snapshot(&self, kind: &str, report: &PublishReport) -> Result<()>;
}

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    /// Insert unless an assessment for the same event id exists. Returns
    /// whether the row was new.
    async fn append_assessment(&self, assessment: &RiskAssessment) -> Result<bool>;

    async fn get_assessment(&self, event_id: &str) -> Result<Option<RiskAssessment>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert_session(&self, session: &SessionState) -> Result<()>;

    async fn sessions_for(&self, source_address: &str) -> Result<Vec<SessionState>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn upsert_alert(&self, alert: &Alert) -> Result<()>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>>;

    /// Most recent unresolved alert for (source, alert rule) created at or after `since`.
    async fn find_unresolved(
        &self,
        source_address: Option<&str>,
        alert_rule: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>>;

    /// Newest first.
    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;
}

#[async_trait]
pub trait EscalationStore: Send + Sync {
    async fn upsert_escalation(&self, record: &EscalationRecord) -> Result<()>;

    async fn get_escalation(&self, alert_id: &str) -> Result<Option<EscalationRecord>>;

    /// Records a scheduler may claim at `now`: pending ones that are due, and
    /// firing ones whose lease has expired.
    async fn due_escalations(&self, now: DateTime<Utc>) -> Result<Vec<EscalationRecord>>;

    /// Pending and firing records.
    async fn pending_escalations(&self) -> Result<Vec<EscalationRecord>>;

    /// Move a claimable record to `Firing` with a lease ending at `lease_until`.
    /// Returns false when another scheduler got there first or the record is
    /// no longer claimable.
    async fn claim_escalation(
        &self,
        alert_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Compare-and-set on the record state. Returns false when the record is
    /// missing or no longer in `from`.
    async fn transition_escalation(
        &self,
        alert_id: &str,
        from: EscalationState,
        to: EscalationState,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn append_attempt(&self, attempt: &NotificationAttempt) -> Result<()>;

    async fn attempts_for(&self, alert_id: &str) -> Result<Vec<NotificationAttempt>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert-if-absent. True when this caller claimed the key first.
    async fn claim_key(&self, key: &str) -> Result<bool>;

    /// Forget a claimed key, so the work it guarded can run again.
    async fn release_key(&self, key: &str) -> Result<()>;
}

/// Everything the pipeline persists, behind one handle.
pub trait Store:
    RuleSnapshotStore + AssessmentStore + SessionStore + AlertStore + EscalationStore + NotificationLog + IdempotencyStore
{
}

impl<T> Store for T where
    T: RuleSnapshotStore
        + AssessmentStore
        + SessionStore
        + AlertStore
        + EscalationStore
        + NotificationLog
        + IdempotencyStore
{
}
