use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCounters {
    pub succeeded: u64,
    pub failed: u64,
}

/// Delivery counters since start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Messages handed to [`crate::DispatchManager::dispatch`].
    pub dispatched: u64,
    /// First-attempt outcomes per channel.
    pub channels: HashMap<String, ChannelCounters>,
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
    pub retries_exhausted: u64,
    pub retries_rejected: u64,
    pub stale_purged: u64,
    pub abandoned_on_shutdown: u64,
}

impl DispatchStats {
    pub(crate) fn record_outcome(&mut self, channel: &str, success: bool) {
        let counters = self.channels.entry(channel.to_string()).or_default();
        if success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }
    }

    /// Share of first attempts that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        let (ok, total) = self
            .channels
            .values()
            .fold((0u64, 0u64), |(ok, total), c| {
                (ok + c.succeeded, total + c.succeeded + c.failed)
            });
        if total == 0 {
            return 0.0;
        }
        ok as f64 * 100.0 / total as f64
    }
}
