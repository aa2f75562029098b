use std::{future::Future, time::Duration};

use {
    async_trait::async_trait,
    milesguard_channels::{Error, NotificationChannel, Result, SendOutcome, to_outcome},
    milesguard_common::RelevantMessage,
    milesguard_config::TelegramConfig,
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        payloads::SendMessageSetters,
        prelude::*,
        types::{ParseMode, Recipient},
    },
    tracing::{debug, info, warn},
};

use crate::{format::format_notification, rate::RateGate};

pub const CHANNEL_NAME: &str = "telegram";

/// `retry_after` replies honoured within one send before giving up.
const RETRY_AFTER_MAX_RETRIES: usize = 4;

struct Target {
    bot: Bot,
    chat: Recipient,
}

pub struct TelegramChannel {
    enabled: bool,
    /// `None` when the token or chat id is missing.
    target: Option<Target>,
    gate: RateGate,
    request_timeout: Duration,
}

impl TelegramChannel {
    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        let target = if config.has_token() && config.has_chat_id() {
            let client = teloxide::net::default_reqwest_settings()
                .timeout(config.request_timeout())
                .build()
                .map_err(|e| Error::external("building telegram http client", e))?;
            let chat = parse_recipient(config.chat_id.as_deref().unwrap_or_default());
            Some(Target {
                bot: Bot::with_client(config.token.expose_secret(), client),
                chat,
            })
        } else {
            if config.enabled {
                warn!(
                    has_token = config.has_token(),
                    has_chat_id = config.has_chat_id(),
                    "telegram credentials incomplete, notifications disabled"
                );
            }
            None
        };

        Ok(Self {
            enabled: config.enabled,
            target,
            gate: RateGate::per_minute(config.rate_limit_per_minute),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.target.is_some()
    }

    /// Check the token against the Bot API and return the bot username.
    pub async fn verify(&self) -> Result<String> {
        let target = self.target()?;
        let me = target
            .bot
            .get_me()
            .await
            .map_err(|e| classify(e, self.request_timeout))?;
        let username = me.username.clone().unwrap_or_default();
        info!(bot = %username, "telegram bot verified");
        Ok(username)
    }

    fn target(&self) -> Result<&Target> {
        self.target
            .as_ref()
            .ok_or_else(|| Error::disabled("telegram bot token or chat id not configured"))
    }

    async fn deliver(&self, relevant: &RelevantMessage) -> Result<()> {
        let target = self.target()?;
        let text = format_notification(relevant);

        within(self.request_timeout, async {
            self.gate.acquire().await;
            with_retry_after("send message", || {
                let request = target
                    .bot
                    .send_message(target.chat.clone(), text.clone())
                    .parse_mode(ParseMode::Html);
                async move { request.await }
            })
            .await
            .map_err(|e| classify(e, self.request_timeout))
        })
        .await?;

        debug!(message_id = relevant.id(), "telegram notification sent");
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send_notification(&self, message: &RelevantMessage) -> SendOutcome {
        let outcome = to_outcome(self.deliver(message).await);
        if let Some(error) = &outcome.error {
            warn!(message_id = message.id(), reason = ?outcome.reason, %error, "telegram delivery failed");
        }
        outcome
    }
}

/// Numeric ids address chats directly; anything else is a public username.
fn parse_recipient(chat_id: &str) -> Recipient {
    let chat_id = chat_id.trim();
    match chat_id.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) if chat_id.starts_with('@') => Recipient::ChannelUsername(chat_id.to_string()),
        Err(_) => Recipient::ChannelUsername(format!("@{chat_id}")),
    }
}

/// Bound a whole send, rate gate and `retry_after` waits included.
async fn within<T>(limit: Duration, send: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, send)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout { after: limit }))
}

/// Run `request`, sleeping through Telegram `retry_after` replies.
async fn with_retry_after<T, F, Fut>(
    operation: &'static str,
    mut request: F,
) -> std::result::Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RequestError>>,
{
    let mut retries = 0usize;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(wait) = retry_after_duration(&err) else {
                    return Err(err);
                };
                if retries >= RETRY_AFTER_MAX_RETRIES {
                    warn!(
                        operation,
                        retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limit persisted after retries"
                    );
                    return Err(err);
                }
                retries += 1;
                warn!(
                    operation,
                    retries,
                    max_retries = RETRY_AFTER_MAX_RETRIES,
                    retry_after_secs = wait.as_secs(),
                    "telegram rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
            },
        }
    }
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

/// Map a Bot API failure onto the channel error taxonomy.
fn classify(error: RequestError, request_timeout: Duration) -> Error {
    match error {
        RequestError::Api(
            api @ (ApiError::InvalidToken
            | ApiError::ChatNotFound
            | ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup),
        ) => Error::config(api),
        RequestError::MigrateToChatId(id) => {
            Error::config(format!("chat migrated to supergroup {id}"))
        },
        RequestError::RetryAfter(wait) => Error::RateLimited {
            retry_after: wait.duration(),
        },
        RequestError::Network(e) if e.is_timeout() => Error::Timeout {
            after: request_timeout,
        },
        RequestError::Network(e) => Error::transport("telegram request", e),
        RequestError::Io(e) => Error::transport("telegram io", e),
        other => Error::external("telegram request", other),
    }
}
