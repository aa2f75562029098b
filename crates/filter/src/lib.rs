//! Target-group and keyword filtering for inbound messages.
//!
//! [`decide`] is the pure decision function; [`FilterEngine`] wraps it with
//! runtime pause controls and match statistics.

pub mod decision;
pub mod engine;
pub mod matching;
pub mod normalize;
pub mod stats;

pub use {
    decision::{FilterControls, FilterDecision, FilterReason, decide},
    engine::FilterEngine,
    matching::{is_target_conversation, keyword_context, matched_keywords},
    normalize::normalize_text,
    stats::FilterStats,
};
