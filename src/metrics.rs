use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_events_total", "Events processed by outcome"),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RULE_MATCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_rule_matches_total", "Detection rule matches by rule"),
        &["rule"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RULES_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_rules_rejected_total", "Rule definitions excluded from snapshots by reason"),
        &["reason"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SESSIONS_CLOSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_sessions_closed_total", "Finalized sessions by close reason"),
        &["reason"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static ALERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_alerts_total", "Alert candidates by source kind and outcome"),
        &["source_kind", "outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_notifications_total", "Notification deliveries by channel type and outcome"),
        &["channel_type", "outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static ESCALATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("llm_watch_escalations_total", "Escalation records by outcome"),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SCHEDULER_FAILURES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "llm_watch_scheduler_consecutive_failures",
        "Consecutive failed escalation scheduler ticks",
    ).unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static EVALUATION_SECS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new("llm_watch_evaluation_seconds", "Per-event processing latency seconds by stage"),
        &["stage"],
    ).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

/// Keep label cardinality bounded: long rule names are cut.
fn rule_lbl(rule: &str) -> String {
    rule.chars().take(64).collect()
}

pub fn inc_events(outcome: &str) {
    EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn inc_rule_match(rule: &str) {
    RULE_MATCHES_TOTAL.with_label_values(&[&rule_lbl(rule)]).inc();
}

pub fn inc_rules_rejected(reason: &str) {
    RULES_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn inc_sessions_closed(reason: &str) {
    SESSIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn inc_alerts(source_kind: &str, outcome: &str) {
    ALERTS_TOTAL.with_label_values(&[source_kind, outcome]).inc();
}

pub fn inc_notifications(channel_type: &str, outcome: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[channel_type, outcome]).inc();
}

pub fn inc_escalations(outcome: &str) {
    ESCALATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_scheduler_failures(n: i64) {
    SCHEDULER_FAILURES.set(n);
}

pub fn obs_evaluation(stage: &str, secs: f64) {
    EVALUATION_SECS.with_label_values(&[stage]).observe(secs);
}

/// Render every registered metric in the text exposition format.
pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let _ = encoder.encode(&metric_families, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
