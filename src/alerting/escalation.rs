//! Escalation scheduler.
//!
//! Escalations live in the store as `EscalationRecord`s with a `due_at`
//! timestamp, so a restart only delays them until the next tick. A record is
//! claimed as `Firing` with a lease before any notification is sent and only
//! marked `Fired` once dispatch returns. If the process dies in between, the
//! lease runs out and a later tick fires the record again, so escalation is
//! at least once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::AlertEngine;
use crate::error::Result;
use crate::metrics;
use crate::models::{AlertStatus, EscalationRecord, EscalationState, Severity};
use crate::notify::Dispatcher;
use crate::rules::RuleRegistry;
use crate::store::Store;

pub const DEGRADED_TITLE: &str = "Escalation scheduler degraded";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub fired: usize,
    pub cancelled: usize,
    pub failed: usize,
}

enum Step {
    Fired,
    Cancelled,
    Skipped,
}

pub struct EscalationScheduler {
    store: Arc<dyn Store>,
    engine: Arc<AlertEngine>,
    registry: Arc<RuleRegistry>,
    dispatcher: Arc<Dispatcher>,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<AlertEngine>,
        registry: Arc<RuleRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let failure_threshold = engine.config().scheduler_failure_threshold.max(1);
        Self { store, engine, registry, dispatcher, failure_threshold, consecutive_failures: AtomicU32::new(0) }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    async fn step(&self, record: &EscalationRecord, now: DateTime<Utc>) -> Result<Step> {
        let id = record.alert_id.as_str();
        let alert = match self.store.get_alert(id).await? {
            Some(a) if a.status == AlertStatus::New => a,
            _ => {
                let cancelled = self
                    .store
                    .transition_escalation(id, record.state, EscalationState::Cancelled, now)
                    .await?;
                if cancelled {
                    metrics::inc_escalations("cancelled");
                    return Ok(Step::Cancelled);
                }
                return Ok(Step::Skipped);
            }
        };

        let lease_until = now + self.engine.config().escalation_lease();
        if !self.store.claim_escalation(id, now, lease_until).await? {
            return Ok(Step::Skipped);
        }
        if record.state == EscalationState::Firing {
            warn!(alert_id = %id, "escalation lease expired before delivery was confirmed; firing again");
        }

        let alert = match self.engine.mark_escalated(id, now).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(alert_id = %id, error = %e, "failed to flag alert as escalated; notifying anyway");
                let mut local = alert;
                local.metadata.insert("escalated".into(), json!(true));
                local.metadata.insert("escalated_at".into(), json!(now));
                local
            }
        };
        let channels = alert
            .alert_rule
            .as_deref()
            .and_then(|name| self.registry.alert_rules().get(name).map(|r| r.channels.clone()))
            .unwrap_or_default();
        let attempts = self.dispatcher.dispatch(&alert, &channels, true).await;
        info!(
            alert_id = %id,
            channels = attempts.len(),
            delivered = attempts.iter().filter(|a| a.delivered()).count(),
            "alert escalated"
        );
        if !self
            .store
            .transition_escalation(id, EscalationState::Firing, EscalationState::Fired, now)
            .await?
        {
            warn!(alert_id = %id, "escalation claim was taken over before it was marked fired");
        }
        metrics::inc_escalations("fired");
        Ok(Step::Fired)
    }

    /// Process every escalation claimable at `now`: pending ones that are due
    /// and firing ones whose lease has run out.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.store.due_escalations(now).await?;
        let mut report = TickReport::default();
        for record in &due {
            match self.step(record, now).await {
                Ok(Step::Fired) => report.fired += 1,
                Ok(Step::Cancelled) => report.cancelled += 1,
                Ok(Step::Skipped) => {}
                Err(e) => {
                    error!(alert_id = %record.alert_id, error = %e, "escalation step failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// `tick` plus health tracking. A tick that errors or fails any record
    /// counts as a failure.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Option<TickReport> {
        let result = self.tick(now).await;
        let last_error = match &result {
            Ok(r) if r.failed == 0 => None,
            Ok(r) => Some(format!("{} escalation(s) failed", r.failed)),
            Err(e) => Some(e.to_string()),
        };
        self.record_health(last_error, now).await;
        result.ok()
    }

    /// Enough failed ticks in a row raise a system alert; a clean tick resets the count.
    async fn record_health(&self, last_error: Option<String>, now: DateTime<Utc>) {
        let reason = match last_error {
            None => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                metrics::set_scheduler_failures(0);
                return;
            }
            Some(reason) => reason,
        };
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_scheduler_failures(i64::from(failures));
        warn!(consecutive_failures = failures, error = %reason, "escalation tick failed");
        if failures < self.failure_threshold {
            return;
        }
        let mut metadata = Map::new();
        metadata.insert("consecutive_failures".into(), json!(failures));
        metadata.insert("last_error".into(), json!(reason));
        if let Err(e) = self.engine.raise_system(DEGRADED_TITLE, Severity::High, metadata, now).await {
            error!(error = %e, "failed to raise scheduler health alert");
        }
    }

    /// Re-arm after a restart: everything still pending or firing is picked
    /// up, and anything already claimable fires now.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        let pending = self.store.pending_escalations().await?;
        let overdue = pending.iter().filter(|r| r.claimable(now)).count();
        let in_flight = pending.iter().filter(|r| r.state == EscalationState::Firing).count();
        info!(pending = pending.len(), overdue, in_flight, "recovered escalation schedule");
        self.run_tick(now).await;
        Ok(pending.len())
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_tick(Utc::now()).await;
                }
            }
        }
        info!("escalation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{AlertCandidate, Raised};
    use crate::config::{AlertingConfig, NotificationConfig};
    use crate::models::{Alert, AlertSourceKind, ChannelTarget};
    use crate::notify::NotificationSender;
    use crate::store::{AlertFilter, AlertStore, EscalationStore, MemoryStore, NotificationLog};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl NotificationSender for Recorder {
        async fn send(&self, target: &ChannelTarget, _alert: &Alert, escalation: bool) -> crate::error::Result<()> {
            self.sent.lock().push((target.id.clone(), escalation));
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Arc<AlertEngine>,
        scheduler: EscalationScheduler,
        sender: Arc<Recorder>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(AlertEngine::new(AlertingConfig::default(), store.clone()));
        let registry = Arc::new(RuleRegistry::new());
        registry.publish_alert_rules_json(vec![json!({
            "name": "Keyword alerts",
            "rule_type": "detection_rule",
            "severity": "critical",
            "detection_rule_ids": ["Critical Keywords"],
            "notifications": {"webhook": {"url": "https://hooks.example/x"}}
        })]);
        let sender = Arc::new(Recorder::default());
        let notify = NotificationConfig { initial_backoff_ms: 1, max_backoff_ms: 2, ..Default::default() };
        let dispatcher = Arc::new(Dispatcher::with_sender(&notify, store.clone(), sender.clone()));
        let scheduler = EscalationScheduler::new(store.clone(), engine.clone(), registry, dispatcher);
        Harness { store, engine, scheduler, sender }
    }

    async fn critical_alert(engine: &AlertEngine) -> String {
        let candidate = AlertCandidate {
            title: "leak".into(),
            severity: Severity::Critical,
            source_kind: AlertSourceKind::DetectionRule,
            alert_rule: "Keyword alerts".into(),
            source_address: Some("10.0.0.1".into()),
            event_id: Some("e1".into()),
            metadata: Map::new(),
            trigger_key: None,
        };
        match engine.raise(candidate, t0()).await.unwrap() {
            Raised::Created(a) => a.id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unacknowledged_critical_escalates_exactly_once() {
        let h = harness();
        let id = critical_alert(&h.engine).await;

        let early = h.scheduler.tick(t0() + ChronoDuration::minutes(14)).await.unwrap();
        assert_eq!(early, TickReport::default());

        let due = t0() + ChronoDuration::minutes(15);
        assert_eq!(h.scheduler.tick(due).await.unwrap().fired, 1);
        assert_eq!(h.scheduler.tick(due + ChronoDuration::minutes(5)).await.unwrap().fired, 0);

        assert_eq!(*h.sender.sent.lock(), vec![("Keyword alerts:webhook".to_string(), true)]);
        let alert = h.store.get_alert(&id).await.unwrap().unwrap();
        assert!(alert.is_escalated());
        assert_eq!(alert.status, AlertStatus::New);
        let attempts = h.store.attempts_for(&id).await.unwrap();
        assert!(attempts[0].escalation);
    }

    #[tokio::test]
    async fn acknowledged_before_delay_never_escalates() {
        let h = harness();
        let id = critical_alert(&h.engine).await;
        h.engine.acknowledge(&id, "alice", t0() + ChronoDuration::minutes(5)).await.unwrap();

        let report = h.scheduler.tick(t0() + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(report.fired, 0);
        assert!(h.sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn status_change_without_cancel_is_caught_at_fire_time() {
        let h = harness();
        let id = critical_alert(&h.engine).await;
        let mut alert = h.store.get_alert(&id).await.unwrap().unwrap();
        alert.status = AlertStatus::Resolved;
        h.store.upsert_alert(&alert).await.unwrap();

        let report = h.scheduler.tick(t0() + ChronoDuration::minutes(20)).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.store.get_escalation(&id).await.unwrap().unwrap().state, EscalationState::Cancelled);
    }

    #[tokio::test]
    async fn recover_fires_overdue_records() {
        let h = harness();
        critical_alert(&h.engine).await;
        let pending = h.scheduler.recover(t0() + ChronoDuration::hours(2)).await.unwrap();
        assert_eq!(pending, 1);
        assert_eq!(h.sender.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn store_outage_fails_the_tick() {
        let h = harness();
        h.store.set_unavailable(true);
        assert!(h.scheduler.run_tick(t0()).await.is_none());
        assert!(h.scheduler.run_tick(t0()).await.is_none());
        assert_eq!(h.scheduler.consecutive_failures(), 2);

        h.store.set_unavailable(false);
        assert!(h.scheduler.run_tick(t0()).await.is_some());
        assert_eq!(h.scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn third_consecutive_failure_raises_health_alert() {
        let h = harness();
        h.scheduler.record_health(Some("boom".into()), t0()).await;
        h.scheduler.record_health(Some("boom".into()), t0()).await;
        assert_eq!(h.store.alert_count(), 0);

        h.scheduler.record_health(Some("boom".into()), t0()).await;
        h.scheduler.record_health(Some("boom".into()), t0()).await;
        let alerts = h.store.list_alerts(&AlertFilter::default()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, DEGRADED_TITLE);
        assert_eq!(alerts[0].source_kind, AlertSourceKind::System);
        assert_eq!(alerts[0].duplicate_count(), 1);
    }

    #[tokio::test]
    async fn orphaned_record_is_cancelled() {
        let h = harness();
        let record = EscalationRecord::pending("ghost", t0(), t0());
        h.store.upsert_escalation(&record).await.unwrap();
        let report = h.scheduler.run_tick(t0()).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn claimed_escalation_refires_after_lease() {
        let h = harness();
        let id = critical_alert(&h.engine).await;
        let due = t0() + ChronoDuration::minutes(15);

        // a scheduler claimed the record and died before dispatching
        assert!(h.store.claim_escalation(&id, due, due + ChronoDuration::minutes(5)).await.unwrap());

        let during = h.scheduler.tick(due + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(during.fired, 0);
        assert!(h.sender.sent.lock().is_empty());

        let after = h.scheduler.tick(due + ChronoDuration::minutes(6)).await.unwrap();
        assert_eq!(after.fired, 1);
        assert_eq!(h.sender.sent.lock().len(), 1);
        let rec = h.store.get_escalation(&id).await.unwrap().unwrap();
        assert_eq!(rec.state, EscalationState::Fired);
        assert!(rec.lease_until.is_none());

        assert_eq!(h.scheduler.tick(due + ChronoDuration::hours(1)).await.unwrap().fired, 0);
    }

    #[tokio::test]
    async fn acknowledging_a_firing_record_cancels_it() {
        let h = harness();
        let id = critical_alert(&h.engine).await;
        let due = t0() + ChronoDuration::minutes(15);
        assert!(h.store.claim_escalation(&id, due, due + ChronoDuration::minutes(5)).await.unwrap());

        h.engine.acknowledge(&id, "alice", due + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(h.store.get_escalation(&id).await.unwrap().unwrap().state, EscalationState::Cancelled);
        assert_eq!(h.scheduler.tick(due + ChronoDuration::hours(1)).await.unwrap().fired, 0);
        assert!(h.sender.sent.lock().is_empty());
    }
}
