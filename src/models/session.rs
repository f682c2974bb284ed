use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Severity bands over a 0-100 average score.
    pub fn from_score(avg: f64) -> Self {
        if avg >= 80.0 {
            RiskLevel::Critical
        } else if avg >= 60.0 {
            RiskLevel::High
        } else if avg >= 30.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Inactivity,
    MaxDuration,
    Sweep,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Inactivity => "inactivity",
            CloseReason::MaxDuration => "max_duration",
            CloseReason::Sweep => "sweep",
        }
    }
}

/// Windowed behavioural summary for one source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub source_address: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: u64,
    /// Events that produced a score; unassessable events count toward
    /// `request_count` only.
    pub assessed_count: u64,
    pub risk_sum: f64,
    pub avg_risk_score: f64,
    /// Welford accumulator for score variance.
    pub risk_m2: f64,
    pub flagged_count: u64,
    pub provider_counts: BTreeMap<String, u64>,
    pub model_counts: BTreeMap<String, u64>,
    pub top_providers: Vec<String>,
    pub top_models: Vec<String>,
    pub risk_level: RiskLevel,
    pub anomalous_patterns: Vec<String>,
    pub closed: bool,
    pub close_reason: Option<CloseReason>,
}

impl SessionState {
    pub fn open(source_address: &str, start: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id(source_address, start),
            source_address: source_address.to_string(),
            window_start: start,
            window_end: start,
            request_count: 0,
            assessed_count: 0,
            risk_sum: 0.0,
            avg_risk_score: 0.0,
            risk_m2: 0.0,
            flagged_count: 0,
            provider_counts: BTreeMap::new(),
            model_counts: BTreeMap::new(),
            top_providers: Vec::new(),
            top_models: Vec::new(),
            risk_level: RiskLevel::Low,
            anomalous_patterns: Vec::new(),
            closed: false,
            close_reason: None,
        }
    }

    pub fn flagged_ratio(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.flagged_count as f64 / self.request_count as f64
        }
    }

    /// Population variance of the assessed scores.
    pub fn risk_variance(&self) -> f64 {
        if self.assessed_count < 2 {
            0.0
        } else {
            self.risk_m2 / self.assessed_count as f64
        }
    }
}

/// Deterministic id for the (source, window start) key.
pub fn session_id(source_address: &str, window_start: DateTime<Utc>) -> String {
    let material = format!("{}|{}", source_address, window_start.timestamp_millis());
    blake3::hash(material.as_bytes()).to_hex().as_str()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_cover_the_score_range() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29.9), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Critical);
    }

    #[test]
    fn session_id_depends_on_window_start() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        assert_eq!(session_id("10.0.0.1", t0), session_id("10.0.0.1", t0));
        assert_ne!(session_id("10.0.0.1", t0), session_id("10.0.0.1", t1));
    }
}
