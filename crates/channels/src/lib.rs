//! Notification channel contract.
//!
//! Every downstream delivery mechanism (Telegram, file log, ...) implements
//! [`NotificationChannel`] and reports a structured [`SendOutcome`], so the
//! dispatcher can fan out and retry uniformly.

pub mod channel;
pub mod error;
pub mod registry;

pub use {
    channel::NotificationChannel,
    error::{Error, Result, to_outcome},
    milesguard_common::{ChannelResult, FailureReason, SendOutcome},
    registry::ChannelRegistry,
};
