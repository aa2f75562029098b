//! The milesguard pipeline: deduplication, orchestration and the
//! [`Watcher`] runtime that wires the connection, filter and dispatcher.

pub mod dedup;
pub mod orchestrator;
pub mod service;

pub use {
    dedup::{DedupCache, Fingerprint},
    orchestrator::{DropReason, Orchestrator, OrchestratorSnapshot, Processed},
    service::{Watcher, WatcherStatus},
};
