use {async_trait::async_trait, milesguard_common::GroupInfo, tokio::sync::mpsc};

use crate::{error::Result, types::TransportEvent};

/// A WhatsApp Web session provider.
///
/// `connect` opens a session and returns once the link is being negotiated;
/// every later signal for that session (open, close, messages, group
/// changes) arrives on `events`. A session ends with a close update or by
/// dropping the sender.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Every group the account participates in.
    async fn fetch_all_groups(&self) -> Result<Vec<GroupInfo>>;

    /// Unlink this device. Stored credentials become useless afterwards.
    async fn logout(&self) -> Result<()>;

    /// Close the live session, keeping credentials for the next start.
    async fn close(&self) -> Result<()>;

    /// Remove stored credentials so the next connect starts a fresh pairing.
    async fn clear_session(&self) -> Result<()>;
}
