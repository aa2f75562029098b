use std::sync::{Mutex, RwLock};

use {milesguard_config::FilterConfig, tracing::info};

use crate::{
    decision::{FilterControls, FilterDecision, decide},
    matching,
    normalize::normalize_text,
    stats::FilterStats,
};

/// Shared filter with runtime controls and statistics.
///
/// Decisions read the controls under a read lock, so pausing from another
/// task takes effect for the next message.
pub struct FilterEngine {
    config: FilterConfig,
    controls: RwLock<FilterControls>,
    stats: Mutex<FilterStats>,
}

impl FilterEngine {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            controls: RwLock::new(FilterControls::default()),
            stats: Mutex::new(FilterStats::default()),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run [`decide`] against the current controls and record the outcome.
    pub fn decide(&self, conversation_name: &str, text: &str) -> FilterDecision {
        let decision = {
            let controls = self.controls.read().unwrap_or_else(|e| e.into_inner());
            decide(conversation_name, text, &self.config, &controls)
        };
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(conversation_name, &decision);
        decision
    }

    pub fn is_target_conversation(&self, conversation_name: &str) -> bool {
        matching::is_target_conversation(conversation_name, &self.config)
    }

    /// Keywords in `text`, ignoring paused keywords.
    pub fn matched_keywords(&self, text: &str) -> Vec<String> {
        let controls = self.controls.read().unwrap_or_else(|e| e.into_inner());
        matching::matched_keywords(text, &self.config, |k| controls.is_keyword_paused(k))
    }

    pub fn pause_group(&self, name: &str) -> bool {
        let inserted = self.with_controls(|c| c.paused_groups.insert(normalize_text(name)));
        if inserted {
            info!(group = name, "group paused");
        }
        inserted
    }

    pub fn resume_group(&self, name: &str) -> bool {
        let removed = self.with_controls(|c| c.paused_groups.remove(&normalize_text(name)));
        if removed {
            info!(group = name, "group resumed");
        }
        removed
    }

    pub fn pause_keyword(&self, keyword: &str) -> bool {
        let inserted = self.with_controls(|c| c.paused_keywords.insert(normalize_text(keyword)));
        if inserted {
            info!(keyword, "keyword paused");
        }
        inserted
    }

    pub fn resume_keyword(&self, keyword: &str) -> bool {
        let removed = self.with_controls(|c| c.paused_keywords.remove(&normalize_text(keyword)));
        if removed {
            info!(keyword, "keyword resumed");
        }
        removed
    }

    pub fn set_global_pause(&self, paused: bool) {
        self.with_controls(|c| c.globally_paused = paused);
        info!(paused, "global filter pause updated");
    }

    /// Flip the global pause and return the new state.
    pub fn toggle_global_pause(&self) -> bool {
        let paused = self.with_controls(|c| {
            c.globally_paused = !c.globally_paused;
            c.globally_paused
        });
        info!(paused, "global filter pause toggled");
        paused
    }

    pub fn is_globally_paused(&self) -> bool {
        self.controls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .globally_paused
    }

    pub fn controls(&self) -> FilterControls {
        self.controls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> FilterStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = FilterStats::default();
    }

    fn with_controls<T>(&self, f: impl FnOnce(&mut FilterControls) -> T) -> T {
        let mut controls = self.controls.write().unwrap_or_else(|e| e.into_inner());
        f(&mut controls)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::decision::FilterReason, std::sync::Arc};

    fn engine() -> FilterEngine {
        FilterEngine::new(FilterConfig {
            target_groups: vec!["Southern Flights".into()],
            keywords: vec!["bonus".into(), "100%".into()],
            ..Default::default()
        })
    }

    #[test]
    fn decisions_update_stats() {
        let engine = engine();
        assert!(engine.decide("Southern Flights", "bonus").should_process);
        assert!(!engine.decide("Other", "bonus").should_process);
        let stats = engine.stats();
        assert_eq!((stats.processed, stats.matched, stats.rejected), (2, 1, 1));
        engine.reset_stats();
        assert_eq!(engine.stats().processed, 0);
    }

    #[test]
    fn exposes_target_and_keyword_queries() {
        let engine = engine();
        assert!(engine.is_target_conversation("Southern Flights Official"));
        assert_eq!(engine.matched_keywords("BONUS 100%"), vec!["bonus", "100%"]);
    }

    #[test]
    fn pause_and_resume_group() {
        let engine = engine();
        assert!(engine.pause_group("SOUTHERN flights"));
        assert!(!engine.pause_group("southern flights"));
        assert_eq!(
            engine.decide("Southern Flights", "bonus").reason,
            FilterReason::GroupPaused
        );
        assert!(engine.resume_group("Southern Flights"));
        assert!(engine.decide("Southern Flights", "bonus").should_process);
    }

    #[test]
    fn pause_keyword_hides_it_from_matches() {
        let engine = engine();
        engine.pause_keyword("Bônus");
        assert_eq!(engine.matched_keywords("bonus 100%"), vec!["100%"]);
        engine.resume_keyword("bonus");
        assert_eq!(engine.matched_keywords("bonus 100%"), vec!["bonus", "100%"]);
    }

    #[test]
    fn toggle_global_pause_from_another_thread() {
        let engine = Arc::new(engine());
        let remote = Arc::clone(&engine);
        let paused = std::thread::spawn(move || remote.toggle_global_pause())
            .join()
            .unwrap();
        assert!(paused);
        assert!(engine.is_globally_paused());
        assert_eq!(
            engine.decide("Southern Flights", "bonus").reason,
            FilterReason::GloballyPaused
        );
        engine.set_global_pause(false);
        assert!(engine.decide("Southern Flights", "bonus").should_process);
    }
}
