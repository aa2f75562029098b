//! Local JSONL archive of relevant messages, one file per group and day.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    milesguard_channels::{Error, NotificationChannel, Result, SendOutcome, to_outcome},
    milesguard_common::RelevantMessage,
    milesguard_config::FileLogConfig,
    serde::{Deserialize, Serialize},
    tokio::{fs, io::AsyncWriteExt, sync::Mutex},
    tracing::{debug, warn},
};

pub const CHANNEL_NAME: &str = "file";

/// One archived line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub text: String,
    pub matched_keywords: Vec<String>,
    pub group_id: String,
    pub group_name: String,
    pub message_length: usize,
    pub processed_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(relevant: &RelevantMessage, processed_at: DateTime<Utc>) -> Self {
        let message = &relevant.message;
        Self {
            id: message.id.clone(),
            timestamp: message.received_at,
            sender: message.sender_name.clone(),
            text: message.text.clone(),
            matched_keywords: relevant.matched_keywords.clone(),
            group_id: message.conversation_id.clone(),
            group_name: message.conversation_name().to_string(),
            message_length: message.text.chars().count(),
            processed_at,
        }
    }
}

pub struct FileLogChannel {
    enabled: bool,
    directory: PathBuf,
    /// Serializes appends so concurrent lines never interleave.
    write_lock: Mutex<()>,
}

impl FileLogChannel {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            directory: directory.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &FileLogConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(&config.directory)
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<directory>/<YYYY-MM-DD>/<sanitized group>.jsonl`
    pub fn path_for(&self, relevant: &RelevantMessage) -> PathBuf {
        let message = &relevant.message;
        self.directory
            .join(message.received_at.format("%Y-%m-%d").to_string())
            .join(format!(
                "{}.jsonl",
                sanitize_filename(message.conversation_name())
            ))
    }

    async fn append(&self, relevant: &RelevantMessage) -> Result<()> {
        if !self.enabled {
            return Err(Error::disabled("file log disabled"));
        }
        let path = self.path_for(relevant);
        let mut line = serde_json::to_string(&FileRecord::new(relevant, Utc::now()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::transport(format!("creating {}", parent.display()), e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::transport(format!("opening {}", path.display()), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::transport(format!("writing {}", path.display()), e))?;

        debug!(message_id = relevant.id(), path = %path.display(), "message archived");
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for FileLogChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send_notification(&self, message: &RelevantMessage) -> SendOutcome {
        let outcome = to_outcome(self.append(message).await);
        if let Some(error) = &outcome.error {
            warn!(message_id = message.id(), %error, "file log write failed");
        }
        outcome
    }
}

/// Lowercase, path separators and shell-hostile characters to `-`,
/// whitespace runs to `_`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' => out.push('-'),
            c => out.extend(c.to_lowercase()),
        }
    }
    match out.trim_matches('.') {
        "" => "unknown".to_string(),
        trimmed => trimmed.to_string(),
    }
}
