//! Telegram notification channel for milesguard.
//!
//! Sends one HTML-formatted Bot API message per relevant WhatsApp message,
//! paced by a client-side rate gate and honouring Telegram's `retry_after`.

pub mod channel;
pub mod format;
pub mod rate;

pub use {channel::TelegramChannel, format::format_notification, rate::RateGate};
