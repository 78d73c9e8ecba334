//! Maps free-form model output onto one of a use case's option labels.
//!
//! Small quantized VLMs tend to restate the instruction ("pickup if a person
//! is reaching, browsing if ..."), so matching is ordered and conservative:
//!
//! - keyword mode: first option (in declared order) with a keyword contained
//!   in the text wins, otherwise the first option is the negative label
//! - direct mode: only the leading clause is compared against the options,
//!   with a substring fallback for very short replies

use crate::config::UseCaseDefinition;

/// Label used when nothing matches.
pub const NO_EVENT_LABEL: &str = "No Event Detected";

/// Delimiters that end the leading clause in direct mode.
const CLAUSE_DELIMITERS: [&str; 5] = ["\n", ".", ",", " if ", " or "];

/// Replies shorter than this (in characters) may match by containment.
const SHORT_REPLY_CHARS: usize = 30;

/// Characters of raw text kept in the display preview.
const RAW_PREVIEW_CHARS: usize = 80;

/// A label together with the text it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub label: String,
    pub raw: String,
}

/// First [`RAW_PREVIEW_CHARS`] characters, with an ellipsis when cut.
pub fn raw_preview(raw: &str) -> String {
    match raw.char_indices().nth(RAW_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}

pub fn classify(raw: &str, use_case: &UseCaseDefinition) -> Classification {
    let lower = raw.to_lowercase();
    let label = if use_case.uses_keywords() {
        match_keywords(&lower, use_case)
    } else {
        match_direct(&lower, &use_case.options)
    };
    Classification {
        label: label.unwrap_or_else(|| NO_EVENT_LABEL.to_string()),
        raw: raw.to_string(),
    }
}

fn match_keywords(lower: &str, use_case: &UseCaseDefinition) -> Option<String> {
    for option in &use_case.options {
        let Some(keywords) = use_case.keywords.get(option) else {
            continue;
        };
        if keywords
            .iter()
            .any(|k| lower.contains(k.to_lowercase().as_str()))
        {
            return Some(option.clone());
        }
    }
    // Nothing mentioned: the first option is the negative label
    use_case.options.first().cloned()
}

fn match_direct(lower: &str, options: &[String]) -> Option<String> {
    let lead = leading_clause(lower);

    let by_prefix = options.iter().find(|option| {
        let option = option.to_lowercase();
        lead == option || lead.starts_with(option.as_str())
    });
    if let Some(option) = by_prefix {
        return Some(option.clone());
    }

    if lower.chars().count() < SHORT_REPLY_CHARS {
        return options
            .iter()
            .find(|option| lower.contains(option.to_lowercase().as_str()))
            .cloned();
    }
    None
}

/// Text up to the earliest delimiter (a delimiter at position 0 is ignored),
/// trimmed of whitespace and quotes.
fn leading_clause(lower: &str) -> &str {
    let mut lead = lower;
    for delim in CLAUSE_DELIMITERS {
        if let Some(pos) = lead.find(delim) {
            if pos > 0 {
                lead = &lead[..pos];
            }
        }
    }
    lead.trim_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r' | '\'' | '"'))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn use_case(options: &[&str], keywords: &[(&str, &[&str])]) -> UseCaseDefinition {
        UseCaseDefinition {
            name: "test".to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            keywords: keywords
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect::<HashMap<_, _>>(),
            details: String::new(),
            system_prompt: String::new(),
            user_prompt: String::new(),
        }
    }

    fn shopping() -> UseCaseDefinition {
        use_case(
            &["empty", "pickup", "browsing"],
            &[
                ("empty", &["no person", "nobody"][..]),
                ("pickup", &["grabbing", "picking", "examining"][..]),
                ("browsing", &["walking", "cart"][..]),
            ],
        )
    }

    #[test]
    fn test_keyword_matches() {
        let uc = shopping();
        assert_eq!(classify("no person visible, empty aisle", &uc).label, "empty");
        assert_eq!(classify("examining product closely", &uc).label, "pickup");
        assert_eq!(classify("A man Walking past", &uc).label, "browsing");
    }

    #[test]
    fn test_keyword_miss_defaults_to_first_option() {
        assert_eq!(classify("a red shelf", &shopping()).label, "empty");
    }

    #[test]
    fn test_keyword_priority_follows_option_order() {
        // Both "nobody" (empty) and "cart" (browsing) appear; empty is declared first
        let uc = shopping();
        assert_eq!(classify("nobody near the cart", &uc).label, "empty");
    }

    #[test]
    fn test_keyword_mode_without_options_returns_sentinel() {
        let uc = use_case(&[], &[("pickup", &["grabbing"][..])]);
        assert_eq!(classify("grabbing", &uc).label, NO_EVENT_LABEL);
    }

    #[test]
    fn test_direct_mode_truncates_restated_instruction() {
        let uc = use_case(&["pickup", "browsing"], &[]);
        let c = classify("pickup if person reaching, browsing if walking", &uc);
        assert_eq!(c.label, "pickup");
    }

    #[test]
    fn test_direct_mode_strips_quotes_and_case() {
        let uc = use_case(&["pickup", "browsing"], &[]);
        assert_eq!(classify("\"Browsing\".", &uc).label, "browsing");
    }

    #[test]
    fn test_direct_mode_short_reply_contains_option() {
        let uc = use_case(&["pickup", "browsing"], &[]);
        assert_eq!(classify("I think browsing", &uc).label, "browsing");
    }

    #[test]
    fn test_direct_mode_long_reply_does_not_use_containment() {
        let uc = use_case(&["pickup", "browsing"], &[]);
        let c = classify("the person in the frame seems to be browsing the shelves", &uc);
        assert_eq!(c.label, NO_EVENT_LABEL);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let uc = shopping();
        let text = "someone picking up a bottle from the cart";
        let first = classify(text, &uc);
        for _ in 0..10 {
            assert_eq!(classify(text, &uc), first);
        }
    }

    #[test]
    fn test_raw_preview_cuts_at_80_chars() {
        assert_eq!(raw_preview(&"x".repeat(100)), format!("{}...", "x".repeat(80)));
        assert_eq!(raw_preview("short"), "short");
    }
}
