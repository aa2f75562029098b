use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Context, Result};

/// File Baileys writes once pairing has completed.
const CREDENTIALS_FILE: &str = "creds.json";

/// On-disk authentication state for one WhatsApp account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("creating session directory {}", self.path.display()))
    }

    pub async fn has_credentials(&self) -> bool {
        tokio::fs::try_exists(self.path.join(CREDENTIALS_FILE))
            .await
            .unwrap_or(false)
    }

    /// Delete all stored auth state and recreate the empty directory.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => info!(path = %self.path.display(), "cleared WhatsApp session"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no session to clear");
            },
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("removing session directory {}", self.path.display())
                });
            },
        }
        self.ensure().await
    }
}
