//! Multi-channel dispatch with a bounded, backoff-governed retry queue.
//!
//! [`DispatchManager::dispatch`] fans a relevant message out to every enabled
//! channel concurrently. Retryable failures land in the [`RetryQueue`], which a
//! background scan drains on a fixed interval until each (message, channel)
//! pair succeeds, exhausts its attempts, or goes stale.

pub mod manager;
pub mod queue;
pub mod stats;

pub use {
    manager::{DispatchManager, DispatchReport, DispatchSettings},
    queue::{FailureDisposition, RetryItem, RetryKey, RetryQueue, RetryQueueStatus},
    stats::{ChannelCounters, DispatchStats},
};
