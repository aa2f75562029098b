//! Fan-out, background retry scan, and shutdown drain.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    futures::{StreamExt, future::join_all, stream::FuturesUnordered},
    milesguard_channels::ChannelRegistry,
    milesguard_common::{
        Backoff, ChannelResult, EventSender, RelevantMessage, RetryFailure, SendOutcome,
        WatchEvent, emit,
    },
    milesguard_config::DispatchConfig,
    serde::Serialize,
    tokio::{
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    queue::{FailureDisposition, RetryItem, RetryKey, RetryQueue, RetryQueueStatus},
    stats::DispatchStats,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// When false, relevant messages are reported but not delivered.
    pub enabled: bool,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub scan_interval: Duration,
    pub stale_after: Duration,
    pub shutdown_timeout: Duration,
}

impl DispatchSettings {
    pub fn from_config(enabled: bool, cfg: &DispatchConfig) -> Self {
        Self {
            enabled,
            max_attempts: cfg.max_attempts,
            retry_base_delay: cfg.retry_base_delay(),
            scan_interval: cfg.scan_interval(),
            stale_after: cfg.stale_after(),
            shutdown_timeout: cfg.shutdown_timeout(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(true, &DispatchConfig::default())
    }
}

/// Per-channel outcomes of one fan-out, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub message_id: String,
    pub results: Vec<ChannelResult>,
}

impl DispatchReport {
    pub fn outcome(&self, channel: &str) -> Option<&SendOutcome> {
        self.results
            .iter()
            .find(|r| r.channel == channel)
            .map(|r| &r.outcome)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.outcome.success)
    }
}

pub struct DispatchManager {
    channels: ChannelRegistry,
    settings: DispatchSettings,
    queue: Mutex<RetryQueue>,
    stats: Mutex<DispatchStats>,
    events: EventSender,
    cancel: CancellationToken,
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchManager {
    pub fn new(channels: ChannelRegistry, settings: DispatchSettings, events: EventSender) -> Self {
        let backoff = Backoff::uncapped(settings.retry_base_delay, settings.max_attempts);
        Self {
            channels,
            queue: Mutex::new(RetryQueue::new(backoff)),
            settings,
            stats: Mutex::new(DispatchStats::default()),
            events,
            cancel: CancellationToken::new(),
            scan_handle: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Start the periodic retry scan. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.scan_handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!("retry scan already running");
            return;
        }
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        *slot = Some(tokio::spawn(async move {
            manager.scan_loop(cancel).await;
        }));
        info!(
            interval_ms = self.settings.scan_interval.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "retry scan started"
        );
    }

    /// Deliver `message` to every enabled channel concurrently.
    ///
    /// Each channel's outcome is handled as soon as it arrives, so a slow
    /// channel never delays another channel's retry scheduling.
    pub async fn dispatch(&self, message: RelevantMessage) -> DispatchReport {
        let message = Arc::new(message);
        let message_id = message.id().to_string();
        self.lock_stats().dispatched += 1;

        if !self.settings.enabled {
            debug!(message_id, "delivery disabled, skipping fan-out");
            return self.complete(message_id, Vec::new());
        }

        let channels = self.channels.enabled();
        if channels.is_empty() {
            warn!(message_id, "no enabled notification channel");
        }

        let mut pending: FuturesUnordered<_> = channels
            .into_iter()
            .enumerate()
            .map(|(index, channel)| {
                let message = Arc::clone(&message);
                async move {
                    let outcome = channel.send_notification(&message).await;
                    (index, channel.name().to_string(), outcome)
                }
            })
            .collect();

        let mut results = Vec::new();
        while let Some((index, channel, outcome)) = pending.next().await {
            self.handle_first_attempt(&message, &channel, &outcome);
            results.push((index, ChannelResult { channel, outcome }));
        }
        results.sort_by_key(|(index, _)| *index);

        self.complete(message_id, results.into_iter().map(|(_, r)| r).collect())
    }

    /// One scan round: purge stale items, then retry every due item
    /// concurrently.
    pub async fn process_due(&self) {
        let now = Instant::now();
        let (stale, due) = {
            let mut queue = self.lock_queue();
            (
                queue.purge_stale(now, self.settings.stale_after),
                queue.take_due(now),
            )
        };

        for item in stale {
            self.lock_stats().stale_purged += 1;
            warn!(
                message_id = item.message.id(),
                channel = %item.channel,
                attempts = item.attempts,
                "retry item went stale, dropping"
            );
            self.emit_retry_failed(&item, item.attempts, RetryFailure::Stale);
        }

        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "retrying failed notifications");
        join_all(due.into_iter().map(|item| self.retry(item))).await;
    }

    /// Stop the scan, give every pending item one more attempt, and report
    /// whatever is left as abandoned. Bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        self.cancel.cancel();

        let handle = self
            .scan_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle
            && tokio::time::timeout_at(deadline, &mut handle).await.is_err()
        {
            warn!("retry scan did not stop in time, aborting it");
            handle.abort();
        }

        let pending = self.lock_queue().take_all();
        if !pending.is_empty() {
            info!(count = pending.len(), "final retry pass before shutdown");
            let pass = join_all(pending.into_iter().map(|item| self.retry(item)));
            if tokio::time::timeout_at(deadline, pass).await.is_err() {
                warn!("final retry pass timed out");
            }
        }

        let leftover = self.lock_queue().drain();
        for item in leftover {
            self.lock_stats().abandoned_on_shutdown += 1;
            warn!(
                message_id = item.message.id(),
                channel = %item.channel,
                attempts = item.attempts,
                "abandoning undelivered notification at shutdown"
            );
            self.emit_retry_failed(&item, item.attempts, RetryFailure::Abandoned);
        }
        info!("dispatch manager stopped");
    }

    pub fn stats(&self) -> DispatchStats {
        self.lock_stats().clone()
    }

    pub fn retry_queue_status(&self) -> RetryQueueStatus {
        self.lock_queue().status(Instant::now())
    }

    pub fn pending_retries(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn has_retry(&self, message_id: &str, channel: &str) -> bool {
        self.lock_queue()
            .contains(&RetryKey::new(message_id, channel))
    }

    /// Drop every queued retry without signalling. Returns how many were removed.
    pub fn clear_retry_queue(&self) -> usize {
        let cleared = self.lock_queue().drain().len();
        info!(cleared, "retry queue cleared");
        cleared
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn scan_loop(&self, cancel: CancellationToken) {
        let interval = self.settings.scan_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.process_due().await,
            }
        }
        debug!("retry scan stopped");
    }

    fn handle_first_attempt(&self, message: &Arc<RelevantMessage>, channel: &str, outcome: &SendOutcome) {
        let message_id = message.id();
        self.lock_stats().record_outcome(channel, outcome.success);

        if outcome.success {
            debug!(message_id, channel, "notification delivered");
            return;
        }
        let reason = outcome.reason.map(|r| r.as_str()).unwrap_or("unknown");
        let error = outcome.error.as_deref().unwrap_or_default();
        if !outcome.is_retryable() {
            warn!(message_id, channel, reason, error, "notification failed, not retrying");
            return;
        }

        let disposition = self
            .lock_queue()
            .record_failure(message, channel, Instant::now());
        match disposition {
            FailureDisposition::Scheduled { attempts, retry_in } => {
                warn!(
                    message_id,
                    channel,
                    reason,
                    error,
                    attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "notification failed, retry scheduled"
                );
            },
            FailureDisposition::Exhausted { attempts } => {
                self.lock_stats().retries_exhausted += 1;
                warn!(message_id, channel, reason, error, attempts, "notification failed, no attempts left");
                emit(&self.events, WatchEvent::RetryFailed {
                    message_id: message_id.to_string(),
                    channel: channel.to_string(),
                    attempts,
                    reason: RetryFailure::Exhausted,
                });
            },
        }
    }

    async fn retry(&self, item: RetryItem) {
        let key = item.key();
        let Some(channel) = self.channels.get(&item.channel) else {
            self.lock_queue().remove(&key);
            self.lock_stats().retries_rejected += 1;
            warn!(channel = %item.channel, "retry target channel no longer registered");
            self.emit_retry_failed(&item, item.attempts, RetryFailure::Rejected);
            return;
        };

        self.lock_stats().retries_attempted += 1;
        let outcome = channel.send_notification(&item.message).await;
        let message_id = item.message.id();

        if outcome.success {
            let completed = self.lock_queue().complete_success(&key);
            if let Some(attempts) = completed {
                self.lock_stats().retries_succeeded += 1;
                info!(message_id, channel = %item.channel, attempts, "retry delivered notification");
                emit(&self.events, WatchEvent::RetrySuccess {
                    message_id: message_id.to_string(),
                    channel: item.channel.clone(),
                    attempts,
                });
            }
            return;
        }

        let error = outcome.error.as_deref().unwrap_or_default();
        if !outcome.is_retryable() {
            let removed = self.lock_queue().remove(&key);
            if removed.is_some() {
                self.lock_stats().retries_rejected += 1;
                warn!(message_id, channel = %item.channel, error, "retry rejected by channel, giving up");
                self.emit_retry_failed(&item, item.attempts + 1, RetryFailure::Rejected);
            }
            return;
        }

        let disposition = self.lock_queue().complete_failure(&key, Instant::now());
        match disposition {
            Some(FailureDisposition::Scheduled { attempts, retry_in }) => {
                warn!(
                    message_id,
                    channel = %item.channel,
                    error,
                    attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "retry failed, rescheduled"
                );
            },
            Some(FailureDisposition::Exhausted { attempts }) => {
                self.lock_stats().retries_exhausted += 1;
                warn!(message_id, channel = %item.channel, error, attempts, "retry attempts exhausted");
                self.emit_retry_failed(&item, attempts, RetryFailure::Exhausted);
            },
            None => {},
        }
    }

    fn complete(&self, message_id: String, results: Vec<ChannelResult>) -> DispatchReport {
        emit(&self.events, WatchEvent::DispatchCompleted {
            message_id: message_id.clone(),
            results: results.clone(),
        });
        DispatchReport {
            message_id,
            results,
        }
    }

    fn emit_retry_failed(&self, item: &RetryItem, attempts: u32, reason: RetryFailure) {
        emit(&self.events, WatchEvent::RetryFailed {
            message_id: item.message.id().to_string(),
            channel: item.channel.clone(),
            attempts,
            reason,
        });
    }

    fn lock_queue(&self) -> MutexGuard<'_, RetryQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, DispatchStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}
