//! End-to-end behaviour of the pipeline on small, hand-checked event streams.
mod helpers;

use chrono::Duration;
use serde_json::json;

use helpers::{detection_alert_rule, event, harness, keyword_rule, t0};
use llm_watch_pipeline::store::{AlertFilter, AlertStore, EscalationStore, NotificationLog};
use llm_watch_pipeline::{AlertStatus, AssessmentOutcome, CloseReason, EscalationState, Event, PipelineError, Raised};

#[tokio::test]
async fn keyword_rule_flags_matching_prompt() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password|secret", 50, 0, false)]).await;

    let out = h.pipeline.process(event("e1", "10.0.0.1", "my password is 1234", t0()), t0()).await.unwrap();
    assert_eq!(out.assessment.score, 50);
    assert!(out.assessment.flagged);
    assert_eq!(out.assessment.flag_reason, vec!["Critical Keywords".to_string()]);
}

#[tokio::test]
async fn stop_on_match_excludes_lower_priority_points() {
    let h = harness();
    h.pipeline
        .publish_rules(vec![
            keyword_rule("Low", "token", 30, 50, false),
            keyword_rule("High", "token", 50, 100, true),
        ])
        .await;

    let out = h.pipeline.process(event("e1", "10.0.0.1", "here is my api token", t0()), t0()).await.unwrap();
    assert_eq!(out.assessment.score, 50);
    assert_eq!(out.assessment.flag_reason, vec!["High".to_string()]);
}

#[tokio::test]
async fn threshold_alert_waits_for_sample_floor() {
    let h = harness();
    h.pipeline
        .publish_rules(vec![
            keyword_rule("Hot", "alpha", 80, 0, false),
            keyword_rule("Warm", "beta", 30, 0, false),
        ])
        .await;
    h.pipeline
        .publish_alert_rules(vec![json!({
            "name": "Sustained risk",
            "rule_type": "threshold",
            "severity": "medium",
            "threshold_config": {
                "metric": "avg_risk_score",
                "operator": "greater_than",
                "value": 70,
                "time_window": "5m",
                "min_requests": 10
            }
        })])
        .await;

    for i in 0..9 {
        let at = t0() + Duration::seconds(i * 10);
        let out = h.pipeline.process(event(&format!("e{}", i), "10.0.0.7", "alpha", at), at).await.unwrap();
        assert!(out.alerts.is_empty(), "event {} alerted early", i);
    }
    let at = t0() + Duration::seconds(95);
    let out = h.pipeline.process(event("e9", "10.0.0.7", "beta", at), at).await.unwrap();
    let alert = out.alerts[0].created().expect("alert created");
    assert_eq!(alert.metadata["observed_value"], json!(75.0));
    assert_eq!(alert.metadata["sample_count"], json!(10));
}

#[tokio::test]
async fn repeat_trigger_inside_window_counts_duplicate() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password|secret", 50, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "high", &["Critical Keywords"])]).await;

    let first = h.pipeline.process(event("e1", "10.0.0.1", "password please", t0()), t0()).await.unwrap();
    assert_eq!(first.notifications.len(), 2);
    let later = t0() + Duration::minutes(10);
    let second = h.pipeline.process(event("e2", "10.0.0.1", "the secret is out", later), later).await.unwrap();
    assert!(matches!(second.alerts[0], Raised::Suppressed(_)));
    assert!(second.notifications.is_empty());

    let alerts = h.store.list_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].duplicate_count(), 1);
}

#[tokio::test]
async fn inactivity_gap_splits_sessions() {
    let h = harness();
    for i in 0..3 {
        let at = t0() + Duration::minutes(i);
        h.pipeline.process(event(&format!("a{}", i), "10.0.0.3", "hello", at), at).await.unwrap();
    }
    let resumed = t0() + Duration::hours(2);
    let out = h.pipeline.process(event("b0", "10.0.0.3", "hello again", resumed), resumed).await.unwrap();

    let session = out.session.unwrap();
    assert_eq!(session.request_count, 1);
    assert_eq!(session.window_start, resumed);

    let closed = h.pipeline.aggregator().close_all(resumed).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].close_reason, Some(CloseReason::Sweep));
}

#[tokio::test]
async fn critical_alert_escalates_once_unless_acknowledged() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password|secret", 90, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "critical", &["Critical Keywords"])]).await;

    let a = h.pipeline.process(event("e1", "10.0.0.1", "password", t0()), t0()).await.unwrap();
    let b = h.pipeline.process(event("e2", "10.0.0.2", "secret", t0()), t0()).await.unwrap();
    let escalated_id = a.alerts[0].created().unwrap().id.clone();
    let acked_id = b.alerts[0].created().unwrap().id.clone();

    h.pipeline.engine().acknowledge(&acked_id, "oncall", t0() + Duration::minutes(3)).await.unwrap();

    let scheduler = h.pipeline.scheduler();
    let due = t0() + Duration::minutes(16);
    assert_eq!(scheduler.tick(due).await.unwrap().fired, 1);
    assert_eq!(scheduler.tick(due + Duration::minutes(30)).await.unwrap().fired, 0);

    let escalations: Vec<_> = h.sender.sent.lock().iter().filter(|(_, _, esc)| *esc).cloned().collect();
    assert_eq!(escalations.len(), 2, "one per channel of the escalated alert");
    assert!(escalations.iter().all(|(_, id, _)| *id == escalated_id));

    let attempts = h.store.attempts_for(&acked_id).await.unwrap();
    assert!(attempts.iter().all(|a| !a.escalation));
    let acked = h.store.get_alert(&acked_id).await.unwrap().unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged);
}

#[tokio::test]
async fn unassessable_event_is_recorded_but_never_alerts() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password", 50, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "high", &["Critical Keywords"])]).await;

    let mut ev = event("e1", "10.0.0.1", "password", t0());
    ev.model = None;
    let out = h.pipeline.process(ev, t0()).await.unwrap();
    assert!(!out.assessment.is_assessed());
    assert_eq!(out.assessment.score, 0);
    assert!(out.alerts.is_empty());
    let session = out.session.unwrap();
    assert_eq!(session.request_count, 1);
    assert_eq!(session.assessed_count, 0);
}

#[tokio::test]
async fn alert_survives_store_outage_and_redelivery() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password|secret", 50, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "high", &["Critical Keywords"])]).await;

    h.store.set_alert_writes_failing(true);
    let failed = h.pipeline.process(event("e1", "10.0.0.1", "password dump", t0()), t0()).await;
    assert!(matches!(failed, Err(PipelineError::StorageError(_))));

    h.store.set_alert_writes_failing(false);
    let out = h.pipeline.process(event("e1", "10.0.0.1", "password dump", t0()), t0()).await.unwrap();
    assert_eq!(out.alerts.len(), 1);
    assert!(out.alerts[0].created().is_some());
    assert_eq!(out.notifications.len(), 2);
    assert_eq!(out.session.unwrap().request_count, 1);

    let replay = h.pipeline.process(event("e1", "10.0.0.1", "password dump", t0()), t0()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(h.store.list_alerts(&AlertFilter::default()).await.unwrap().len(), 1);
    assert_eq!(h.sender.sent.lock().len(), 2);
}

#[tokio::test]
async fn escalation_claimed_without_delivery_fires_after_lease() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password", 90, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "critical", &["Critical Keywords"])]).await;

    let out = h.pipeline.process(event("e1", "10.0.0.1", "password", t0()), t0()).await.unwrap();
    let id = out.alerts[0].created().unwrap().id.clone();

    // a scheduler instance took the record and stopped before sending
    let due = t0() + Duration::minutes(15);
    assert!(h.store.claim_escalation(&id, due, due + Duration::minutes(5)).await.unwrap());

    let scheduler = h.pipeline.scheduler();
    assert_eq!(scheduler.recover(due + Duration::minutes(2)).await.unwrap(), 1);
    assert!(h.sender.sent.lock().iter().all(|(_, _, esc)| !*esc));

    assert_eq!(scheduler.tick(due + Duration::minutes(6)).await.unwrap().fired, 1);
    let escalations = h.sender.sent.lock().iter().filter(|(_, _, esc)| *esc).count();
    assert_eq!(escalations, 2);
    assert_eq!(h.store.get_escalation(&id).await.unwrap().unwrap().state, EscalationState::Fired);
    assert!(h.store.get_alert(&id).await.unwrap().unwrap().is_escalated());
}

#[tokio::test]
async fn redelivered_event_counts_once_in_threshold_window() {
    let h = harness();
    h.pipeline
        .publish_alert_rules(vec![json!({
            "name": "Burst",
            "rule_type": "threshold",
            "severity": "medium",
            "threshold_config": {
                "metric": "request_count",
                "operator": "greater_than_or_equal",
                "value": 3,
                "time_window": "5m",
                "min_requests": 1
            }
        })])
        .await;

    for i in 0..2 {
        let at = t0() + Duration::seconds(i * 10);
        let out = h.pipeline.process(event(&format!("e{}", i), "10.0.0.9", "hello", at), at).await.unwrap();
        assert!(out.alerts.is_empty());
    }

    let at = t0() + Duration::seconds(30);
    h.store.set_alert_writes_failing(true);
    assert!(h.pipeline.process(event("e2", "10.0.0.9", "hello", at), at).await.is_err());
    h.store.set_alert_writes_failing(false);

    let out = h.pipeline.process(event("e2", "10.0.0.9", "hello", at), at).await.unwrap();
    let alert = out.alerts[0].created().expect("threshold alert");
    assert_eq!(alert.metadata["sample_count"], json!(3));
    assert_eq!(out.session.unwrap().request_count, 3);
}

#[tokio::test]
async fn event_without_timestamp_is_placed_at_ingest_time() {
    let h = harness();
    h.pipeline.publish_rules(vec![keyword_rule("Critical Keywords", "password", 50, 0, false)]).await;
    h.pipeline.publish_alert_rules(vec![detection_alert_rule("Keyword alerts", "high", &["Critical Keywords"])]).await;

    let ev: Event = serde_json::from_value(json!({
        "id": "e1",
        "source_address": "10.0.0.4",
        "provider": "openai",
        "model": "gpt-4",
        "prompt": "my password"
    }))
    .unwrap();
    let out = h.pipeline.process(ev, t0()).await.unwrap();

    assert_eq!(
        out.assessment.outcome,
        AssessmentOutcome::Unassessable { missing: vec!["timestamp".to_string()] }
    );
    assert_eq!(out.assessment.timestamp, t0());
    assert!(out.alerts.is_empty());
    let session = out.session.unwrap();
    assert_eq!(session.request_count, 1);
    assert_eq!(session.window_start, t0());
}
