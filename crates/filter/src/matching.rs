use std::collections::HashSet;

use milesguard_config::FilterConfig;

use crate::normalize::normalize_text;

/// Whether `conversation_name` is one of the configured targets.
///
/// Containment is checked in both directions so a group renamed to
/// `"Southern Flights Official"` still matches target `"Southern Flights"`,
/// and target `"Southern Flights Official"` matches a group called
/// `"Southern Flights"`. Blank names never match.
pub fn is_target_conversation(conversation_name: &str, config: &FilterConfig) -> bool {
    let fold = |s: &str| {
        if config.group_case_sensitive {
            s.trim().to_string()
        } else {
            s.trim().to_lowercase()
        }
    };

    let name = fold(conversation_name);
    if name.is_empty() {
        return false;
    }

    config.target_groups.iter().any(|target| {
        let target = fold(target);
        !target.is_empty() && (name.contains(&target) || target.contains(&name))
    })
}

/// Keywords found in `text`, in configured order and without duplicates.
///
/// Unless `case_sensitive` is set, both sides are normalized and the
/// normalized keyword is reported. Keywords for which `skip` returns true
/// are ignored.
pub fn matched_keywords(
    text: &str,
    config: &FilterConfig,
    skip: impl Fn(&str) -> bool,
) -> Vec<String> {
    let haystack = if config.case_sensitive {
        text.to_string()
    } else {
        normalize_text(text)
    };

    let mut seen = HashSet::new();
    let mut matched = Vec::new();
    for keyword in &config.keywords {
        let needle = if config.case_sensitive {
            keyword.trim().to_string()
        } else {
            normalize_text(keyword)
        };
        if needle.is_empty() || skip(&needle) {
            continue;
        }
        if haystack.contains(&needle) && seen.insert(needle.clone()) {
            matched.push(needle);
        }
    }
    matched
}

/// Snippet of up to `radius` characters on each side of the first
/// occurrence of `keyword`, with `...` marking trimmed ends.
pub fn keyword_context(text: &str, keyword: &str, radius: usize) -> Option<String> {
    let haystack: Vec<char> = normalize_text(text).chars().collect();
    let needle: Vec<char> = normalize_text(keyword).chars().collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    let start = haystack
        .windows(needle.len())
        .position(|window| window == needle.as_slice())?;
    let end = start + needle.len();
    let from = start.saturating_sub(radius);
    let to = (end + radius).min(haystack.len());

    let mut snippet = String::new();
    if from > 0 {
        snippet.push_str("...");
    }
    snippet.extend(&haystack[from..to]);
    if to < haystack.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn config(targets: &[&str], keywords: &[&str]) -> FilterConfig {
        FilterConfig {
            target_groups: targets.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("Southern Flights Official", true)]
    #[case("Southern Flights", true)]
    #[case("southern flights", true)]
    #[case("Flights", true)]
    #[case("Northern Deals", false)]
    #[case("", false)]
    #[case("   ", false)]
    fn target_matching_is_bidirectional(#[case] name: &str, #[case] expected: bool) {
        let cfg = config(&["Southern Flights"], &["bonus"]);
        assert_eq!(is_target_conversation(name, &cfg), expected, "{name}");
    }

    #[test]
    fn case_sensitive_group_matching() {
        let mut cfg = config(&["Southern Flights"], &[]);
        cfg.group_case_sensitive = true;
        assert!(!is_target_conversation("southern flights", &cfg));
        assert!(is_target_conversation("Southern Flights VIP", &cfg));
    }

    #[test]
    fn blank_target_entries_are_ignored() {
        let cfg = config(&["", "  "], &[]);
        assert!(!is_target_conversation("anything", &cfg));
    }

    #[test]
    fn matches_all_keywords_normalized() {
        let cfg = config(&[], &["bonus", "100%"]);
        assert_eq!(matched_keywords("BONUS 100%", &cfg, |_| false), vec![
            "bonus", "100%"
        ]);
    }

    #[test]
    fn reports_in_configured_order() {
        let cfg = config(&[], &["100%", "bonus"]);
        assert_eq!(
            matched_keywords("100% bonus on points transfer", &cfg, |_| false),
            vec!["100%", "bonus"]
        );
        let reversed = config(&[], &["bonus", "100%"]);
        assert_eq!(
            matched_keywords("100% bonus on points transfer", &reversed, |_| false),
            vec!["bonus", "100%"]
        );
    }

    #[test]
    fn accent_variants_collapse_to_one() {
        let cfg = config(&[], &["Bônus", "bonus", "BONUS"]);
        assert_eq!(matched_keywords("bonus hoje", &cfg, |_| false), vec!["bonus"]);
    }

    #[test]
    fn case_sensitive_keywords_match_exactly() {
        let mut cfg = config(&[], &["BONUS", "Smiles"]);
        cfg.case_sensitive = true;
        assert_eq!(matched_keywords("bonus Smiles", &cfg, |_| false), vec![
            "Smiles"
        ]);
    }

    #[test]
    fn skipped_keywords_do_not_match() {
        let cfg = config(&[], &["bonus", "100%"]);
        assert_eq!(
            matched_keywords("100% bonus", &cfg, |k| k == "bonus"),
            vec!["100%"]
        );
    }

    #[test]
    fn no_match_is_empty() {
        let cfg = config(&[], &["bonus"]);
        assert!(matched_keywords("nothing here", &cfg, |_| false).is_empty());
    }

    #[test]
    fn context_marks_trimmed_ends() {
        let snippet = keyword_context("transfer now with a big BONUS today", "bonus", 4).unwrap();
        assert_eq!(snippet, "...big bonus tod...");
    }

    #[test]
    fn context_at_start_has_no_leading_marker() {
        assert_eq!(keyword_context("bonus!", "bonus", 10).as_deref(), Some("bonus!"));
        assert_eq!(keyword_context("bonus", "missing", 3), None);
    }
}
