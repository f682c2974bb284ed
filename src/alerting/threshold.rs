//! Sliding windows for threshold alert rules.
//!
//! One window per (alert rule, source address). Windows slide on event time:
//! every new assessment evicts samples older than `time_window` relative to
//! the newest sample seen, then the rule is re-checked. A window holds at most
//! one sample per event id, so a redelivered event is re-checked without
//! being counted again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::models::{RiskAssessment, ThresholdConfig, ThresholdMetric};

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    event_id: String,
    at: DateTime<Utc>,
    score: u32,
    flagged: bool,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<Sample>,
    ids: HashSet<String>,
    latest: Option<DateTime<Utc>>,
}

impl Window {
    fn evict_front(&mut self) {
        if let Some(old) = self.samples.pop_front() {
            self.ids.remove(&old.event_id);
        }
    }

    fn insert(&mut self, sample: Sample, span: Duration, cap: usize) {
        if self.ids.contains(&sample.event_id) {
            return;
        }
        let latest = match self.latest {
            Some(l) if l >= sample.at => l,
            _ => sample.at,
        };
        self.latest = Some(latest);
        let cutoff = latest - span;
        if sample.at > cutoff {
            // keep samples ordered by time; late arrivals slot in place
            let idx = self.samples.partition_point(|s| s.at <= sample.at);
            self.ids.insert(sample.event_id.clone());
            self.samples.insert(idx, sample);
        }
        while self.samples.front().map_or(false, |s| s.at <= cutoff) {
            self.evict_front();
        }
        while self.samples.len() > cap {
            self.evict_front();
        }
    }

    fn value(&self, metric: ThresholdMetric) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        match metric {
            ThresholdMetric::AvgRiskScore => {
                self.samples.iter().map(|s| f64::from(s.score)).sum::<f64>() / n as f64
            }
            ThresholdMetric::MaxRiskScore => {
                self.samples.iter().map(|s| s.score).max().map(f64::from).unwrap_or(0.0)
            }
            ThresholdMetric::RequestCount => n as f64,
            ThresholdMetric::FlaggedCount => self.samples.iter().filter(|s| s.flagged).count() as f64,
            ThresholdMetric::FlaggedRatio => {
                self.samples.iter().filter(|s| s.flagged).count() as f64 / n as f64
            }
        }
    }
}

/// Window state after one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReading {
    pub value: f64,
    pub samples: u64,
    pub satisfied: bool,
}

pub struct ThresholdWindows {
    windows: DashMap<(String, String), Arc<Mutex<Window>>>,
    max_samples: usize,
}

impl ThresholdWindows {
    pub fn new(max_samples: usize) -> Self {
        Self { windows: DashMap::new(), max_samples: max_samples.max(1) }
    }

    /// Add an assessed event to the (rule, source) window and re-check the rule.
    /// An event already in the window only triggers the re-check.
    pub fn observe(&self, rule: &str, cfg: &ThresholdConfig, source: &str, assessment: &RiskAssessment) -> WindowReading {
        let slot = self
            .windows
            .entry((rule.to_string(), source.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(Window::default())))
            .clone();
        let mut window = slot.lock();
        window.insert(
            Sample {
                event_id: assessment.event_id.clone(),
                at: assessment.timestamp,
                score: assessment.score,
                flagged: assessment.flagged,
            },
            Duration::seconds(cfg.time_window_secs as i64),
            self.max_samples,
        );
        let samples = window.samples.len() as u64;
        let value = window.value(cfg.metric);
        WindowReading {
            value,
            samples,
            satisfied: samples >= cfg.min_requests && cfg.operator.compare(value, cfg.value),
        }
    }

    /// Drop windows whose newest sample is older than `horizon`.
    pub fn prune(&self, horizon: DateTime<Utc>) {
        self.windows.retain(|_, w| w.lock().latest.map_or(false, |l| l >= horizon));
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
