use std::collections::HashSet;

use {
    milesguard_config::FilterConfig,
    serde::{Deserialize, Serialize},
};

use crate::{
    matching::{is_target_conversation, matched_keywords},
    normalize::normalize_text,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    KeywordMatch,
    GloballyPaused,
    GroupPaused,
    NotTargetGroup,
    NoKeywordMatch,
    /// Blank text; nothing to match against.
    InvalidMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub should_process: bool,
    pub matched_keywords: Vec<String>,
    pub reason: FilterReason,
}

impl FilterDecision {
    fn reject(reason: FilterReason) -> Self {
        Self {
            should_process: false,
            matched_keywords: Vec::new(),
            reason,
        }
    }
}

/// Runtime switches layered over the static configuration.
///
/// Group and keyword entries are stored normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterControls {
    pub globally_paused: bool,
    pub paused_groups: HashSet<String>,
    pub paused_keywords: HashSet<String>,
}

impl FilterControls {
    /// Paused entries match group names the same way targets do, by
    /// containment in either direction.
    pub fn is_group_paused(&self, conversation_name: &str) -> bool {
        if self.paused_groups.is_empty() {
            return false;
        }
        let name = normalize_text(conversation_name);
        !name.is_empty()
            && self
                .paused_groups
                .iter()
                .filter(|paused| !paused.is_empty())
                .any(|paused| name.contains(paused.as_str()) || paused.contains(name.as_str()))
    }

    pub fn is_keyword_paused(&self, keyword: &str) -> bool {
        !self.paused_keywords.is_empty() && self.paused_keywords.contains(&normalize_text(keyword))
    }
}

/// Decide whether a message should be forwarded.
///
/// Checks run cheapest first and stop at the first rejection: global pause,
/// blank text, paused group, target membership, then keywords.
pub fn decide(
    conversation_name: &str,
    text: &str,
    config: &FilterConfig,
    controls: &FilterControls,
) -> FilterDecision {
    if controls.globally_paused {
        return FilterDecision::reject(FilterReason::GloballyPaused);
    }
    if text.trim().is_empty() {
        return FilterDecision::reject(FilterReason::InvalidMessage);
    }
    if controls.is_group_paused(conversation_name) {
        return FilterDecision::reject(FilterReason::GroupPaused);
    }
    if !is_target_conversation(conversation_name, config) {
        return FilterDecision::reject(FilterReason::NotTargetGroup);
    }

    let matched = matched_keywords(text, config, |k| controls.is_keyword_paused(k));
    if matched.is_empty() {
        return FilterDecision::reject(FilterReason::NoKeywordMatch);
    }
    FilterDecision {
        should_process: true,
        matched_keywords: matched,
        reason: FilterReason::KeywordMatch,
    }
}
