use std::collections::BTreeSet;

use crate::models::CombinationLogic;

/// Split a pipe-delimited pattern into lowercased, trimmed alternatives.
pub fn split_alternatives(pattern: &str) -> Vec<String> {
    pattern
        .split('|')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Identifier sets accept `|` or `,` separators.
pub fn split_identifiers(pattern: &str) -> BTreeSet<String> {
    pattern
        .split(|c| c == '|' || c == ',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Returns true if any token appears in the haystack. Tokens must already be lowercase.
pub fn contains_any_lowered(hay_lower: &str, tokens: &[String]) -> bool {
    tokens.iter().any(|t| hay_lower.contains(t.as_str()))
}

pub fn contains_all_lowered(hay_lower: &str, tokens: &[String]) -> bool {
    !tokens.is_empty() && tokens.iter().all(|t| hay_lower.contains(t.as_str()))
}

pub fn keyword_match(hay_lower: &str, tokens: &[String], logic: CombinationLogic) -> bool {
    match logic {
        CombinationLogic::And => contains_all_lowered(hay_lower, tokens),
        CombinationLogic::Or => contains_any_lowered(hay_lower, tokens),
    }
}

/// Case-insensitive membership of either identifier in the set.
pub fn identifier_match(set: &BTreeSet<String>, model: Option<&str>, provider: Option<&str>) -> bool {
    [model, provider]
        .into_iter()
        .flatten()
        .any(|id| set.contains(&id.trim().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternatives_are_trimmed_and_lowered() {
        assert_eq!(split_alternatives(" Password | SECRET ||"), vec!["password", "secret"]);
    }

    #[test]
    fn keyword_or_and() {
        let toks = split_alternatives("password|secret");
        assert!(keyword_match("my password is 1234", &toks, CombinationLogic::Or));
        assert!(!keyword_match("my password is 1234", &toks, CombinationLogic::And));
        assert!(keyword_match("secret password", &toks, CombinationLogic::And));
        assert!(!keyword_match("anything", &[], CombinationLogic::And));
    }

    #[test]
    fn identifiers_match_model_or_provider() {
        let set = split_identifiers("gpt-4, deepseek|Mistral-Large");
        assert!(identifier_match(&set, Some("GPT-4"), Some("openai")));
        assert!(identifier_match(&set, Some("r1"), Some("DeepSeek")));
        assert!(!identifier_match(&set, Some("gemini-pro"), Some("google")));
        assert!(!identifier_match(&set, None, None));
    }
}
