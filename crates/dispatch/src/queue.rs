//! Retry bookkeeping keyed by (message id, channel name).
//!
//! The queue holds no timers. Callers pass `now` explicitly and the manager
//! decides when to scan, which keeps every transition testable without a
//! runtime.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use {
    milesguard_common::{Backoff, RelevantMessage},
    serde::Serialize,
    tokio::time::Instant,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub message_id: String,
    pub channel: String,
}

impl RetryKey {
    pub fn new(message_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            channel: channel.into(),
        }
    }
}

/// One failed (message, channel) delivery waiting for another attempt.
#[derive(Debug, Clone)]
pub struct RetryItem {
    pub message: Arc<RelevantMessage>,
    pub channel: String,
    /// Attempts made so far, the initial dispatch included.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Instant,
    pub next_retry_at: Instant,
    /// Set while a retry call is outstanding so scans skip the item.
    pub in_flight: bool,
}

impl RetryItem {
    pub fn key(&self) -> RetryKey {
        RetryKey::new(self.message.id(), self.channel.as_str())
    }
}

/// What happened to an item after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Scheduled { attempts: u32, retry_in: Duration },
    Exhausted { attempts: u32 },
}

/// Snapshot of the queue for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryQueueStatus {
    pub total: usize,
    pub in_flight: usize,
    pub by_channel: HashMap<String, usize>,
    pub average_attempts: f64,
    /// Age of the least recently attempted item.
    pub oldest_attempt_age: Option<Duration>,
}

/// At most one item per (message id, channel).
#[derive(Debug)]
pub struct RetryQueue {
    items: HashMap<RetryKey, RetryItem>,
    backoff: Backoff,
}

impl RetryQueue {
    /// `backoff.max_attempts()` bounds attempts per item.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            items: HashMap::new(),
            backoff,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &RetryKey) -> Option<&RetryItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &RetryKey) -> bool {
        self.items.contains_key(key)
    }

    /// Record a failed attempt for `channel`, creating the item on first
    /// failure. Returns `Exhausted` (and drops the item) once the attempt
    /// limit is reached.
    pub fn record_failure(
        &mut self,
        message: &Arc<RelevantMessage>,
        channel: &str,
        now: Instant,
    ) -> FailureDisposition {
        let key = RetryKey::new(message.id(), channel);
        let backoff = self.backoff;
        let (attempts, scheduled) = {
            let item = match self.items.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    let item = entry.into_mut();
                    item.attempts = item.attempts.saturating_add(1);
                    item.in_flight = false;
                    item
                },
                Entry::Vacant(entry) => entry.insert(RetryItem {
                    message: Arc::clone(message),
                    channel: channel.to_string(),
                    attempts: 1,
                    max_attempts: backoff.max_attempts(),
                    last_attempt_at: now,
                    next_retry_at: now,
                    in_flight: false,
                }),
            };
            let scheduled = Self::schedule(item, backoff, now);
            (item.attempts, scheduled)
        };

        match scheduled {
            Some(retry_in) => FailureDisposition::Scheduled { attempts, retry_in },
            None => {
                self.items.remove(&key);
                FailureDisposition::Exhausted { attempts }
            },
        }
    }

    /// Mark every due item in flight and return copies of them.
    ///
    /// Due means `next_retry_at <= now`, attempts below the limit, and no
    /// retry already outstanding.
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryItem> {
        self.items
            .values_mut()
            .filter(|item| {
                !item.in_flight && item.next_retry_at <= now && item.attempts < item.max_attempts
            })
            .map(|item| {
                item.in_flight = true;
                item.clone()
            })
            .collect()
    }

    /// Remove items whose last attempt is older than `stale_after`.
    pub fn purge_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<RetryItem> {
        let stale: Vec<RetryKey> = self
            .items
            .values()
            .filter(|item| {
                !item.in_flight && now.saturating_duration_since(item.last_attempt_at) > stale_after
            })
            .map(RetryItem::key)
            .collect();
        stale
            .iter()
            .filter_map(|key| self.items.remove(key))
            .collect()
    }

    /// A retry succeeded; the item is removed. Returns the attempt count
    /// including the successful one.
    pub fn complete_success(&mut self, key: &RetryKey) -> Option<u32> {
        self.items
            .remove(key)
            .map(|item| item.attempts.saturating_add(1))
    }

    /// A retry failed. `None` when the item was removed meanwhile.
    pub fn complete_failure(&mut self, key: &RetryKey, now: Instant) -> Option<FailureDisposition> {
        let item = self.items.get_mut(key)?;
        item.in_flight = false;
        item.attempts = item.attempts.saturating_add(1);
        match Self::schedule(item, self.backoff, now) {
            Some(retry_in) => Some(FailureDisposition::Scheduled {
                attempts: item.attempts,
                retry_in,
            }),
            None => {
                let attempts = item.attempts;
                self.items.remove(key);
                Some(FailureDisposition::Exhausted { attempts })
            },
        }
    }

    pub fn remove(&mut self, key: &RetryKey) -> Option<RetryItem> {
        self.items.remove(key)
    }

    /// Mark every item in flight and return copies, for the shutdown pass.
    pub fn take_all(&mut self) -> Vec<RetryItem> {
        self.items
            .values_mut()
            .map(|item| {
                item.in_flight = true;
                item.clone()
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<RetryItem> {
        self.items.drain().map(|(_, item)| item).collect()
    }

    pub fn status(&self, now: Instant) -> RetryQueueStatus {
        let total = self.items.len();
        let mut by_channel: HashMap<String, usize> = HashMap::new();
        let mut attempts_sum = 0u64;
        let mut oldest: Option<Instant> = None;
        let mut in_flight = 0;
        for item in self.items.values() {
            *by_channel.entry(item.channel.clone()).or_default() += 1;
            attempts_sum += u64::from(item.attempts);
            if item.in_flight {
                in_flight += 1;
            }
            oldest = Some(oldest.map_or(item.last_attempt_at, |o| o.min(item.last_attempt_at)));
        }
        RetryQueueStatus {
            total,
            in_flight,
            by_channel,
            average_attempts: if total == 0 {
                0.0
            } else {
                attempts_sum as f64 / total as f64
            },
            oldest_attempt_age: oldest.map(|o| now.saturating_duration_since(o)),
        }
    }

    /// Set `last_attempt_at` and the next retry time after the item's
    /// current attempt count. `None` when no attempts remain.
    fn schedule(item: &mut RetryItem, backoff: Backoff, now: Instant) -> Option<Duration> {
        item.last_attempt_at = now;
        if item.attempts >= item.max_attempts {
            return None;
        }
        let retry_in = backoff.exponential(item.attempts.saturating_sub(1));
        item.next_retry_at = now.checked_add(retry_in).unwrap_or(now);
        Some(retry_in)
    }
}
