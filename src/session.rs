//! Per-source session aggregation.
//!
//! Each source address owns one [`SourceState`] behind its own async mutex, so
//! folds for the same address are serialized while different addresses never
//! contend. A session closes when the gap since its last event exceeds the
//! inactivity threshold or when it would outgrow the maximum duration.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{AnomalyConfig, SessionConfig};
use crate::metrics;
use crate::models::{CloseReason, RiskAssessment, RiskLevel, SessionState};
use crate::store::Store;

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Historical behaviour of one source, built from its finalized sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBaseline {
    pub sessions: u64,
    pub flagged_ratio: RunningStats,
    pub avg_risk: RunningStats,
    pub risk_std_dev: RunningStats,
}

impl SourceBaseline {
    fn absorb(&mut self, session: &SessionState) {
        self.sessions += 1;
        self.flagged_ratio.push(session.flagged_ratio());
        if session.assessed_count > 0 {
            self.avg_risk.push(session.avg_risk_score);
            self.risk_std_dev.push(session.risk_variance().sqrt());
        }
    }
}

/// Pluggable detector for unusual sessions.
pub trait AnomalyHeuristic: Send + Sync {
    /// Names of the patterns the open session exhibits against the baseline.
    fn detect(&self, session: &SessionState, baseline: &SourceBaseline) -> Vec<String>;
}

/// Flags sessions whose flagged ratio, average risk or risk spread sits more
/// than `deviation_factor` standard deviations above the source's history.
pub struct DeviationHeuristic {
    config: AnomalyConfig,
}

impl DeviationHeuristic {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    fn exceeds(&self, observed: f64, stats: &RunningStats, floor: f64) -> bool {
        let margin = (self.config.deviation_factor * stats.std_dev()).max(floor);
        observed - stats.mean > margin
    }
}

impl AnomalyHeuristic for DeviationHeuristic {
    fn detect(&self, session: &SessionState, baseline: &SourceBaseline) -> Vec<String> {
        if baseline.sessions < self.config.min_baseline_sessions
            || session.request_count < self.config.min_session_requests
        {
            return Vec::new();
        }
        let score_floor = self.config.min_ratio_delta * 100.0;
        let mut patterns = Vec::new();
        if self.exceeds(session.flagged_ratio(), &baseline.flagged_ratio, self.config.min_ratio_delta) {
            patterns.push("flagged_ratio_spike".to_string());
        }
        if baseline.avg_risk.count > 0 && session.assessed_count > 0 {
            if self.exceeds(session.avg_risk_score, &baseline.avg_risk, score_floor) {
                patterns.push("risk_score_spike".to_string());
            }
            if self.exceeds(session.risk_variance().sqrt(), &baseline.risk_std_dev, score_floor) {
                patterns.push("risk_variance_spike".to_string());
            }
        }
        patterns
    }
}

#[derive(Default)]
struct SourceState {
    open: Option<SessionState>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    baseline: SourceBaseline,
}

impl SourceState {
    fn remember(&mut self, event_id: &str, capacity: usize) {
        if capacity == 0 || !self.seen.insert(event_id.to_string()) {
            return;
        }
        self.seen_order.push_back(event_id.to_string());
        while self.seen_order.len() > capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Result of folding one assessment.
#[derive(Debug, Clone, Default)]
pub struct FoldOutcome {
    /// The open session after the fold.
    pub session: Option<SessionState>,
    /// Sessions finalized by this fold.
    pub closed: Vec<SessionState>,
    pub replayed: bool,
}

pub struct SessionAggregator {
    config: SessionConfig,
    sources: DashMap<String, Arc<Mutex<SourceState>>>,
    heuristic: Arc<dyn AnomalyHeuristic>,
    store: Arc<dyn Store>,
}

fn top_keys(counts: &BTreeMap<String, u64>, n: usize) -> Vec<String> {
    let mut items: Vec<(&String, &u64)> = counts.iter().collect();
    items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    items.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}

impl SessionAggregator {
    pub fn new(config: SessionConfig, store: Arc<dyn Store>) -> Self {
        let heuristic = Arc::new(DeviationHeuristic::new(config.anomaly.clone()));
        Self::with_heuristic(config, store, heuristic)
    }

    pub fn with_heuristic(config: SessionConfig, store: Arc<dyn Store>, heuristic: Arc<dyn AnomalyHeuristic>) -> Self {
        Self { config, sources: DashMap::new(), heuristic, store }
    }

    fn slot(&self, source: &str) -> Arc<Mutex<SourceState>> {
        self.sources
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SourceState::default())))
            .clone()
    }

    /// Fold one assessment into its source's open session. Assessments without
    /// a source address are not identifiable and are ignored.
    pub async fn fold(&self, assessment: &RiskAssessment) -> FoldOutcome {
        let source = match assessment.source_address.as_deref() {
            Some(s) => s,
            None => return FoldOutcome::default(),
        };
        let slot = self.slot(source);
        let mut state = slot.lock().await;

        if state.seen.contains(&assessment.event_id) {
            debug!(source = %source, event_id = %assessment.event_id, "replayed event skipped by aggregator");
            return FoldOutcome { session: state.open.clone(), closed: Vec::new(), replayed: true };
        }

        let ts = assessment.timestamp;
        let mut closed = Vec::new();
        let expired = state.open.as_ref().and_then(|open| {
            if ts - open.window_end > self.config.inactivity_gap() {
                Some(CloseReason::Inactivity)
            } else if ts - open.window_start > self.config.max_duration() {
                Some(CloseReason::MaxDuration)
            } else {
                None
            }
        });
        if let Some(reason) = expired {
            if let Some(done) = self.finalize(&mut state, reason) {
                closed.push(done);
            }
        }

        let mut session = state.open.take().unwrap_or_else(|| SessionState::open(source, ts));
        self.apply(&mut session, assessment);
        session.anomalous_patterns = self.heuristic.detect(&session, &state.baseline);
        state.open = Some(session.clone());
        state.remember(&assessment.event_id, self.config.dedup_capacity);
        drop(state);

        for s in closed.iter().chain(std::iter::once(&session)) {
            if let Err(e) = self.store.upsert_session(s).await {
                warn!(session_id = %s.session_id, error = %e, "failed to persist session state");
            }
        }
        FoldOutcome { session: Some(session), closed, replayed: false }
    }

    fn apply(&self, session: &mut SessionState, assessment: &RiskAssessment) {
        let ts = assessment.timestamp;
        if ts < session.window_start {
            session.window_start = ts;
        }
        if ts > session.window_end {
            session.window_end = ts;
        }
        session.request_count += 1;
        if assessment.is_assessed() {
            let score = f64::from(assessment.score);
            session.assessed_count += 1;
            session.risk_sum += score;
            let delta = score - session.avg_risk_score;
            session.avg_risk_score += delta / session.assessed_count as f64;
            session.risk_m2 += delta * (score - session.avg_risk_score);
        }
        if assessment.flagged {
            session.flagged_count += 1;
        }
        if let Some(p) = assessment.provider.as_deref().filter(|p| !p.is_empty()) {
            *session.provider_counts.entry(p.to_string()).or_insert(0) += 1;
        }
        if let Some(m) = assessment.model.as_deref().filter(|m| !m.is_empty()) {
            *session.model_counts.entry(m.to_string()).or_insert(0) += 1;
        }
        session.top_providers = top_keys(&session.provider_counts, self.config.top_n);
        session.top_models = top_keys(&session.model_counts, self.config.top_n);
        session.risk_level = RiskLevel::from_score(session.avg_risk_score);
    }

    fn finalize(&self, state: &mut SourceState, reason: CloseReason) -> Option<SessionState> {
        let mut session = state.open.take()?;
        session.closed = true;
        session.close_reason = Some(reason);
        state.baseline.absorb(&session);
        metrics::inc_sessions_closed(reason.as_str());
        debug!(
            source = %session.source_address,
            session_id = %session.session_id,
            requests = session.request_count,
            reason = reason.as_str(),
            "session closed"
        );
        Some(session)
    }

    async fn close_where(&self, now: DateTime<Utc>, force: bool) -> Vec<SessionState> {
        let slots: Vec<Arc<Mutex<SourceState>>> = self.sources.iter().map(|e| e.value().clone()).collect();
        let mut closed = Vec::new();
        for slot in slots {
            let mut state = slot.lock().await;
            let reason = match state.open.as_ref() {
                None => continue,
                Some(open) if now - open.window_start > self.config.max_duration() => CloseReason::MaxDuration,
                Some(open) if now - open.window_end > self.config.inactivity_gap() => CloseReason::Inactivity,
                Some(_) if force => CloseReason::Sweep,
                Some(_) => continue,
            };
            if let Some(done) = self.finalize(&mut state, reason) {
                closed.push(done);
            }
        }
        for s in &closed {
            if let Err(e) = self.store.upsert_session(s).await {
                warn!(session_id = %s.session_id, error = %e, "failed to persist closed session");
            }
        }
        closed
    }

    /// Finalize every open session whose gap or duration limit has passed at `now`.
    pub async fn close_idle(&self, now: DateTime<Utc>) -> Vec<SessionState> {
        self.close_where(now, false).await
    }

    /// Finalize every open session, e.g. on shutdown.
    pub async fn close_all(&self, now: DateTime<Utc>) -> Vec<SessionState> {
        self.close_where(now, true).await
    }

    pub async fn open_session(&self, source: &str) -> Option<SessionState> {
        let slot = self.sources.get(source)?.value().clone();
        let state = slot.lock().await;
        state.open.clone()
    }

    pub async fn baseline(&self, source: &str) -> Option<SourceBaseline> {
        let slot = self.sources.get(source)?.value().clone();
        let state = slot.lock().await;
        Some(state.baseline.clone())
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}
