//! Per-event rule evaluation.
//!
//! [`evaluate`] is a pure function of the event and the snapshot: no clock, no
//! I/O, no shared state. Replaying an event against the same snapshot yields
//! an identical [`RiskAssessment`].

use crate::models::{AssessmentOutcome, Event, RiskAssessment, RuleMatch};
use crate::rules::RuleSnapshot;

pub const MAX_SCORE: u32 = 100;

pub fn evaluate(event: &Event, snapshot: &RuleSnapshot) -> RiskAssessment {
    let missing = event.missing_fields();
    if !missing.is_empty() {
        return RiskAssessment {
            event_id: event.identity(),
            source_address: event.source().map(str::to_string),
            provider: event.provider.clone(),
            model: event.model.clone(),
            timestamp: event.event_time(),
            score: 0,
            flagged: false,
            flag_reason: Vec::new(),
            matches: Vec::new(),
            outcome: AssessmentOutcome::Unassessable { missing },
            snapshot_version: snapshot.version,
        };
    }

    let text = event.combined_text();
    let text_lower = text.to_lowercase();
    let mut total: u64 = 0;
    let mut matches = Vec::new();

    for rule in snapshot.rules() {
        if !rule.matcher.matches(event, &text, &text_lower) {
            continue;
        }
        total += u64::from(rule.points);
        matches.push(RuleMatch { rule: rule.name.clone(), points: rule.points });
        if rule.stop_on_match {
            break;
        }
    }

    let flag_reason: Vec<String> = matches.iter().map(|m| m.rule.clone()).collect();
    RiskAssessment {
        event_id: event.identity(),
        source_address: event.source().map(str::to_string),
        provider: event.provider.clone(),
        model: event.model.clone(),
        timestamp: event.event_time(),
        score: total.min(u64::from(MAX_SCORE)) as u32,
        flagged: !flag_reason.is_empty(),
        flag_reason,
        matches,
        outcome: AssessmentOutcome::Assessed,
        snapshot_version: snapshot.version,
    }
}
