use std::collections::HashMap;

use serde::Serialize;

use crate::decision::FilterDecision;

/// Running counters over every decision the engine has made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub processed: u64,
    pub matched: u64,
    pub rejected: u64,
    pub keyword_hits: HashMap<String, u64>,
    pub group_hits: HashMap<String, u64>,
}

impl FilterStats {
    pub(crate) fn record(&mut self, conversation_name: &str, decision: &FilterDecision) {
        self.processed += 1;
        if !decision.should_process {
            self.rejected += 1;
            return;
        }
        self.matched += 1;
        *self
            .group_hits
            .entry(conversation_name.to_string())
            .or_default() += 1;
        for keyword in &decision.matched_keywords {
            *self.keyword_hits.entry(keyword.clone()).or_default() += 1;
        }
    }

    /// Match rate in percent, zero before the first decision.
    pub fn match_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.matched as f64 * 100.0 / self.processed as f64
    }

    pub fn top_keywords(&self, n: usize) -> Vec<(String, u64)> {
        top(&self.keyword_hits, n)
    }

    pub fn top_groups(&self, n: usize) -> Vec<(String, u64)> {
        top(&self.group_hits, n)
    }
}

/// Highest counts first; ties broken alphabetically for stable output.
fn top(counts: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}
