//! Time-bounded duplicate detection for inbound messages.

use std::{sync::Arc, time::Duration};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    milesguard_common::NormalizedMessage,
    milesguard_config::DedupConfig,
    sha2::{Digest, Sha256},
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Hex digest identifying one logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Sender, the first `prefix_chars` characters of text, and the
    /// `bucket_secs`-wide time bucket of `unix_secs`.
    pub fn compute(
        sender: &str,
        text: &str,
        unix_secs: i64,
        prefix_chars: usize,
        bucket_secs: u64,
    ) -> Self {
        let prefix_end = text
            .char_indices()
            .nth(prefix_chars)
            .map_or(text.len(), |(i, _)| i);
        let bucket = unix_secs.div_euclid(bucket_secs.max(1) as i64);

        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update([0]);
        hasher.update(&text.as_bytes()[..prefix_end]);
        hasher.update([0]);
        hasher.update(bucket.to_string().as_bytes());
        let digest = hasher.finalize();

        Self(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprints seen within the last `ttl`.
///
/// Safe to share between the intake path and the sweep task; DashMap
/// shards tolerate a sweep running while entries are inserted.
pub struct DedupCache {
    entries: DashMap<Fingerprint, Instant>,
    ttl: Duration,
    prefix_chars: usize,
    bucket_secs: u64,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.ttl(),
            prefix_chars: config.text_prefix_chars,
            bucket_secs: config.bucket_secs,
        }
    }

    pub fn fingerprint(&self, message: &NormalizedMessage) -> Fingerprint {
        Fingerprint::compute(
            &message.sender_name,
            &message.text,
            message.received_at.timestamp(),
            self.prefix_chars,
            self.bucket_secs,
        )
    }

    fn is_live(&self, inserted_at: Instant) -> bool {
        inserted_at.elapsed() < self.ttl
    }

    /// Whether `fp` was inserted less than `ttl` ago.
    pub fn has(&self, fp: &Fingerprint) -> bool {
        self.entries
            .get(fp)
            .is_some_and(|inserted_at| self.is_live(*inserted_at))
    }

    pub fn insert(&self, fp: Fingerprint) {
        self.entries.insert(fp, Instant::now());
    }

    /// Atomically record `fp`. Returns `false` when it was already present.
    pub fn check_and_insert(&self, fp: Fingerprint) -> bool {
        match self.entries.entry(fp) {
            Entry::Occupied(mut entry) => {
                if self.is_live(*entry.get()) {
                    return false;
                }
                entry.insert(Instant::now());
                true
            },
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            },
        }
    }

    /// Drop every entry older than `ttl`. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, inserted_at| inserted_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        debug!(removed, remaining = self.entries.len(), "dedup sweep");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    },
                }
            }
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::{TimeZone, Utc},
    };

    fn cache() -> DedupCache {
        DedupCache::new(&DedupConfig::default())
    }

    fn message(sender: &str, text: &str, secs: i64) -> NormalizedMessage {
        NormalizedMessage {
            id: format!("{sender}-{secs}"),
            conversation_id: "1@g.us".into(),
            conversation_name: None,
            sender_name: sender.into(),
            text: text.into(),
            received_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn same_sender_text_and_bucket_collide() {
        let cache = cache();
        let a = cache.fingerprint(&message("Ana", "100% bonus", 1_700_000_040));
        let b = cache.fingerprint(&message("Ana", "100% bonus", 1_700_000_059));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn only_the_text_prefix_counts() {
        let cache = cache();
        let base = "x".repeat(100);
        let a = cache.fingerprint(&message("Ana", &format!("{base}tail one"), 60));
        let b = cache.fingerprint(&message("Ana", &format!("{base}tail two"), 60));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_messages_do_not_collide() {
        let cache = cache();
        let corpus = [
            message("Ana", "100% bonus on points transfer", 120),
            message("Bruno", "100% bonus on points transfer", 120),
            message("Ana", "80% bonus on points transfer", 120),
            message("Ana", "100% bonus on points transfer", 180),
            message("Ana", "Smiles promo ends today", 120),
            message("Carla", "LATAM Pass 2x points", 120),
        ];
        let mut fps: Vec<_> = corpus.iter().map(|m| cache.fingerprint(m)).collect();
        fps.sort();
        fps.dedup();
        assert_eq!(fps.len(), corpus.len());
    }

    #[test]
    fn bucket_boundary_splits() {
        let cache = cache();
        let a = cache.fingerprint(&message("Ana", "hi", 119));
        let b = cache.fingerprint(&message("Ana", "hi", 120));
        assert_ne!(a, b);
    }

    #[test]
    fn check_and_insert_is_first_wins() {
        let cache = cache();
        let fp = cache.fingerprint(&message("Ana", "hi", 0));
        assert!(!cache.has(&fp));
        assert!(cache.check_and_insert(fp.clone()));
        assert!(cache.has(&fp));
        assert!(!cache.check_and_insert(fp));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_are_swept() {
        let cache = cache();
        let fp = cache.fingerprint(&message("Ana", "hi", 0));
        cache.insert(fp.clone());

        tokio::time::advance(Duration::from_secs(3_599)).await;
        assert!(cache.has(&fp));
        assert_eq!(cache.sweep(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.has(&fp));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_can_be_reinserted() {
        let cache = cache();
        let fp = cache.fingerprint(&message("Ana", "hi", 0));
        assert!(cache.check_and_insert(fp.clone()));
        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert!(cache.check_and_insert(fp));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_its_interval() {
        let cache = Arc::new(cache());
        cache.insert(cache.fingerprint(&message("Ana", "hi", 0)));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(1_800), cancel.clone());

        // First sweep at 30 min keeps the entry, the one at 60 min drops it.
        tokio::time::sleep(Duration::from_secs(1_801)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_secs(1_800)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
