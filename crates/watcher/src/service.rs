//! Runtime wiring: one [`Watcher`] owns every long-lived task of the
//! pipeline and tears them down in dependency order.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    milesguard_channels::ChannelRegistry,
    milesguard_common::WatchEvent,
    milesguard_config::MilesguardConfig,
    milesguard_dispatch::{DispatchManager, DispatchSettings, DispatchStats, RetryQueueStatus},
    milesguard_filter::{FilterEngine, FilterStats},
    milesguard_whatsapp::{
        ConnectionHandle, ConnectionSettings, ConnectionSnapshot, Transport, spawn_connection,
    },
    serde::Serialize,
    tokio::{
        sync::{mpsc, watch},
        task::JoinHandle,
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    dedup::DedupCache,
    orchestrator::{Orchestrator, OrchestratorSnapshot},
};

/// Buffered inbound events between the connection driver and the
/// orchestrator.
const INBOUND_BUFFER: usize = 256;

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatcherStatus {
    pub connection: ConnectionSnapshot,
    pub known_groups: usize,
    pub target_groups: usize,
    pub messages_received: u64,
    pub messages_relevant: u64,
    pub dedup_entries: usize,
    pub retry_queue: RetryQueueStatus,
    pub filter: FilterStats,
    pub dispatch: DispatchStats,
    pub uptime_secs: u64,
}

/// Read side shared between the handle and the status logger.
struct Inner {
    connection: watch::Receiver<ConnectionSnapshot>,
    pipeline: watch::Receiver<OrchestratorSnapshot>,
    dedup: Arc<DedupCache>,
    filter: Arc<FilterEngine>,
    dispatcher: Arc<DispatchManager>,
    started_at: Instant,
}

impl Inner {
    fn status(&self) -> WatcherStatus {
        let pipeline = self.pipeline.borrow().clone();
        WatcherStatus {
            connection: *self.connection.borrow(),
            known_groups: pipeline.known_groups,
            target_groups: pipeline.target_groups,
            messages_received: pipeline.received,
            messages_relevant: pipeline.relevant,
            dedup_entries: self.dedup.len(),
            retry_queue: self.dispatcher.retry_queue_status(),
            filter: self.filter.stats(),
            dispatch: self.dispatcher.stats(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

pub struct Watcher {
    inner: Arc<Inner>,
    connection: ConnectionHandle,
    orchestrator: Mutex<Option<JoinHandle<()>>>,
    /// Sweep and status-log tasks.
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Watcher {
    /// Spawn the pipeline on the current runtime. Host events arrive on the
    /// returned receiver.
    pub fn start(
        config: MilesguardConfig,
        transport: Arc<dyn Transport>,
        channels: ChannelRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let dedup = Arc::new(DedupCache::new(&config.dedup));
        let filter = Arc::new(FilterEngine::new(config.filter.clone()));
        let dispatcher = Arc::new(DispatchManager::new(
            channels,
            DispatchSettings::from_config(config.channels.enabled, &config.dispatch),
            events_tx.clone(),
        ));

        let orchestrator = Orchestrator::new(
            Arc::clone(&dedup),
            Arc::clone(&filter),
            Arc::clone(&dispatcher),
            events_tx.clone(),
        );
        let pipeline = orchestrator.subscribe();
        let orchestrator = tokio::spawn(orchestrator.run(inbound_rx));

        let connection = spawn_connection(
            transport,
            ConnectionSettings::from_config(&config.whatsapp),
            inbound_tx,
            events_tx,
        );
        dispatcher.start();

        let background = CancellationToken::new();
        let inner = Arc::new(Inner {
            connection: connection.subscribe(),
            pipeline,
            dedup: Arc::clone(&dedup),
            filter,
            dispatcher,
            started_at: Instant::now(),
        });

        let mut tasks = vec![dedup.spawn_sweeper(config.dedup.sweep_interval(), background.clone())];
        if let Some(secs) = config.status_log_interval_secs.filter(|s| *s > 0) {
            tasks.push(spawn_status_logger(
                Arc::clone(&inner),
                Duration::from_secs(secs),
                background.clone(),
            ));
        }

        info!(
            target_groups = config.filter.target_groups.len(),
            keywords = config.filter.keywords.len(),
            delivery_enabled = config.channels.enabled,
            "watcher started"
        );

        let watcher = Self {
            inner,
            connection,
            orchestrator: Mutex::new(Some(orchestrator)),
            background,
            tasks: Mutex::new(tasks),
        };
        (watcher, events_rx)
    }

    pub fn status(&self) -> WatcherStatus {
        self.inner.status()
    }

    /// Shared filter engine, for runtime pause controls.
    pub fn filter(&self) -> &Arc<FilterEngine> {
        &self.inner.filter
    }

    pub fn dispatcher(&self) -> &Arc<DispatchManager> {
        &self.inner.dispatcher
    }

    /// Unlink the WhatsApp device. The connection ends as failed.
    pub fn logout(&self) {
        self.connection.logout();
    }

    /// Disconnect, let in-flight dispatches finish, drain the retry queue
    /// and stop background timers.
    pub async fn shutdown(&self) {
        info!("watcher shutting down");
        self.connection.shutdown().await;

        let orchestrator = self
            .orchestrator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = orchestrator
            && let Err(e) = task.await
        {
            warn!(error = %e, "orchestrator task failed");
        }

        self.inner.dispatcher.shutdown().await;

        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!("watcher stopped");
    }
}

fn spawn_status_logger(
    inner: Arc<Inner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let status = inner.status();
                    info!(
                        state = ?status.connection.state,
                        groups = status.known_groups,
                        target_groups = status.target_groups,
                        received = status.messages_received,
                        relevant = status.messages_relevant,
                        dedup_entries = status.dedup_entries,
                        pending_retries = status.retry_queue.total,
                        uptime_secs = status.uptime_secs,
                        "watcher status"
                    );
                },
            }
        }
    })
}
