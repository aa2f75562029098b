//! Shared types, error definitions, and utilities used across all milesguard crates.

pub mod backoff;
pub mod delivery;
pub mod error;
pub mod events;
pub mod types;

pub use {
    backoff::Backoff,
    delivery::{ChannelResult, FailureReason, SendOutcome},
    error::FromMessage,
    events::{ConnectionFailure, EventSender, RetryFailure, WatchEvent, emit},
    types::{GroupInfo, NormalizedMessage, RelevantMessage},
};
