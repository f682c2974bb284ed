//! Property tests for rule evaluation.
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use llm_watch_pipeline::evaluator::{evaluate, MAX_SCORE};
use llm_watch_pipeline::{Event, RuleDefinition, RuleKind, RuleRegistry};

const WORDS: &[&str] = &["password", "secret", "token", "invoice", "summary", "key", "draft"];

fn word() -> impl Strategy<Value = &'static str> {
    prop::sample::select(WORDS)
}

fn rules() -> impl Strategy<Value = Vec<(Vec<&'static str>, u32, i32, bool)>> {
    prop::collection::vec(
        (prop::collection::vec(word(), 1..3), 0u32..=100, -5i32..5, prop::bool::weighted(0.2)),
        0..12,
    )
}

fn publish(specs: &[(Vec<&'static str>, u32, i32, bool)]) -> RuleRegistry {
    let registry = RuleRegistry::new();
    let defs = specs
        .iter()
        .enumerate()
        .map(|(i, (words, points, priority, stop))| {
            RuleDefinition::new(format!("r{:02}", i), RuleKind::Keyword, words.join("|"), *points)
                .with_priority(*priority)
                .with_stop_on_match(*stop)
        })
        .collect();
    registry.publish(defs);
    registry
}

fn event(prompt: String) -> Event {
    Event::new("10.0.0.1", "openai", "gpt-4", prompt, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

proptest! {
    #[test]
    fn score_stays_within_bounds(specs in rules(), prompt in prop::collection::vec(word(), 0..8)) {
        let registry = publish(&specs);
        let a = evaluate(&event(prompt.join(" ")), &registry.current());
        prop_assert!(a.score <= MAX_SCORE);
        let raw: u32 = a.matches.iter().map(|m| m.points).sum();
        prop_assert_eq!(a.score, raw.min(MAX_SCORE));
        prop_assert_eq!(a.flagged, !a.matches.is_empty());
    }

    #[test]
    fn evaluation_is_deterministic(specs in rules(), prompt in prop::collection::vec(word(), 0..8)) {
        let registry = publish(&specs);
        let snapshot = registry.current();
        let ev = event(prompt.join(" "));
        prop_assert_eq!(evaluate(&ev, &snapshot), evaluate(&ev, &snapshot));
    }

    #[test]
    fn nothing_follows_a_stop_rule(specs in rules(), prompt in prop::collection::vec(word(), 0..8)) {
        let registry = publish(&specs);
        let snapshot = registry.current();
        let a = evaluate(&event(prompt.join(" ")), &snapshot);
        if let Some(pos) = a.matches.iter().position(|m| snapshot.get(&m.rule).map_or(false, |r| r.stop_on_match)) {
            prop_assert_eq!(pos, a.matches.len() - 1);
        }
    }
}
