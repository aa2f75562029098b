//! Connection lifecycle for the WhatsApp transport.
//!
//! [`ConnectionMachine`] is the pure part: it tracks the link state and
//! decides what a close means (reconnect with backoff, reset a conflicting
//! session, or give up). The driver spawned by [`spawn_connection`] feeds
//! it transport signals, sleeps between attempts, forwards inbound traffic
//! and publishes [`ConnectionSnapshot`]s.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    milesguard_common::{Backoff, ConnectionFailure, EventSender, GroupInfo, WatchEvent, emit},
    milesguard_config::WhatsAppConfig,
    serde::Serialize,
    tokio::{
        sync::{mpsc, watch},
        task::JoinHandle,
        time::sleep,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    transport::Transport,
    types::{
        CloseCause, CloseReason, ConnectionUpdate, GroupUpdate, LinkState, RawMessage,
        TransportEvent,
    },
};

/// Buffered transport signals per session.
const TRANSPORT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Waiting for the user to scan a pairing code.
    AwaitingCredential,
    Connected,
    FailedPermanently,
}

/// What the driver must do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Reconnect { delay: Duration, attempt: u32 },
    /// Clear stored credentials, then connect again after `delay`.
    ResetSession { delay: Duration },
    Terminal {
        reason: ConnectionFailure,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub backoff: Backoff,
    pub conflict_delay: Duration,
    pub roster_fetch_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self {
            backoff: Backoff::new(
                config.reconnect_base_delay(),
                config.reconnect_max_delay(),
                config.reconnect_attempts,
            ),
            conflict_delay: config.conflict_retry_delay(),
            roster_fetch_delay: config.roster_fetch_delay(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&WhatsAppConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    failure: Option<ConnectionFailure>,
    backoff: Backoff,
    conflict_delay: Duration,
}

impl ConnectionMachine {
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            failure: None,
            backoff: settings.backoff,
            conflict_delay: settings.conflict_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts()
    }

    /// Start a connection attempt. Only valid from `Disconnected`.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_credential_required(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::AwaitingCredential;
        }
    }

    /// Returns `false` when the open does not belong to a pending attempt.
    pub fn on_open(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::AwaitingCredential => {
                self.state = ConnectionState::Connected;
                self.reconnect_attempts = 0;
                true
            },
            _ => false,
        }
    }

    pub fn on_close(&mut self, reason: &CloseReason) -> CloseAction {
        if let Some(reason) = self.failure {
            return self.terminal(reason);
        }
        self.state = ConnectionState::Disconnected;
        match reason.classify() {
            CloseCause::SessionConflict => {
                self.reconnect_attempts = 0;
                CloseAction::ResetSession {
                    delay: self.conflict_delay,
                }
            },
            CloseCause::LoggedOut => self.fail(ConnectionFailure::LoggedOut),
            CloseCause::Transient => match self.backoff.delay(self.reconnect_attempts) {
                Some(delay) => {
                    self.reconnect_attempts += 1;
                    CloseAction::Reconnect {
                        delay,
                        attempt: self.reconnect_attempts,
                    }
                },
                None => self.fail(ConnectionFailure::AttemptsExhausted),
            },
        }
    }

    /// Deliberate unlink. The session is torn down first, so the machine
    /// passes through `Disconnected` like any other close.
    pub fn logout(&mut self) -> CloseAction {
        self.stop();
        self.fail(ConnectionFailure::LoggedOut)
    }

    /// Enter `FailedPermanently` from `Disconnected`. Later calls keep the
    /// first reason.
    fn fail(&mut self, reason: ConnectionFailure) -> CloseAction {
        if self.failure.is_none() {
            self.failure = Some(reason);
            self.state = ConnectionState::FailedPermanently;
        }
        self.terminal(self.failure.unwrap_or(reason))
    }

    /// Back to `Disconnected` after a deliberate shutdown.
    pub fn stop(&mut self) {
        if self.failure.is_none() {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn terminal(&self, reason: ConnectionFailure) -> CloseAction {
        CloseAction::Terminal {
            reason,
            attempts: self.reconnect_attempts,
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            max_attempts: self.max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
}

/// Traffic forwarded from a live session to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Messages(Vec<RawMessage>),
    GroupDeltas(Vec<GroupUpdate>),
    GroupUpserts(Vec<GroupInfo>),
    /// Full roster fetched after the connection opened.
    GroupsLoaded(Vec<GroupInfo>),
}

#[derive(Debug)]
enum Command {
    Logout,
}

enum SessionEnd {
    Closed(CloseReason),
    Cancelled,
    Logout,
}

enum Wait {
    Elapsed,
    Cancelled,
    Logout,
}

/// Control surface of a running connection driver.
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Unlink the device and stop reconnecting.
    pub fn logout(&self) {
        if self.commands.send(Command::Logout).is_err() {
            debug!("connection driver already stopped, logout ignored");
        }
    }

    /// Close the session and wait for the driver to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "connection driver task failed");
        }
    }
}

/// Start the connection driver on the current runtime.
pub fn spawn_connection(
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    inbound: mpsc::Sender<InboundEvent>,
    events: EventSender,
) -> ConnectionHandle {
    let machine = ConnectionMachine::new(&settings);
    let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let driver = Driver {
        transport,
        machine,
        settings,
        inbound,
        events,
        snapshot: snapshot_tx,
        commands: commands_rx,
        cancel: cancel.clone(),
        roster: None,
    };
    let task = tokio::spawn(driver.run());

    ConnectionHandle {
        commands: commands_tx,
        snapshot: snapshot_rx,
        cancel,
        task: Mutex::new(Some(task)),
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    machine: ConnectionMachine,
    settings: ConnectionSettings,
    inbound: mpsc::Sender<InboundEvent>,
    events: EventSender,
    snapshot: watch::Sender<ConnectionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    roster: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self) {
        while self.machine.begin_connect() {
            self.publish();
            debug!(
                attempt = self.machine.reconnect_attempts(),
                "connecting to WhatsApp"
            );

            let (tx, mut rx) = mpsc::channel(TRANSPORT_BUFFER);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect(tx) => result,
            };
            let end = match connected {
                Ok(()) => self.pump(&mut rx).await,
                Err(e) => {
                    warn!(error = %e, "failed to open WhatsApp session");
                    SessionEnd::Closed(CloseReason::transient(e.to_string()))
                },
            };
            self.abort_roster();

            let reason = match end {
                SessionEnd::Closed(reason) => reason,
                SessionEnd::Cancelled => {
                    if let Err(e) = self.transport.close().await {
                        warn!(error = %e, "failed to close WhatsApp session");
                    }
                    break;
                },
                SessionEnd::Logout => {
                    if let Err(e) = self.transport.logout().await {
                        warn!(error = %e, "WhatsApp logout failed");
                    }
                    self.logged_out();
                    break;
                },
            };

            let delay = match self.machine.on_close(&reason) {
                CloseAction::Reconnect { delay, attempt } => {
                    warn!(
                        attempt,
                        max_attempts = self.machine.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        status = reason.status_code,
                        reason = %reason.message,
                        "WhatsApp connection closed, reconnecting"
                    );
                    delay
                },
                CloseAction::ResetSession { delay } => {
                    warn!(reason = %reason.message, "WhatsApp session conflict, resetting credentials");
                    if let Err(e) = self.transport.clear_session().await {
                        error!(error = %e, "failed to clear WhatsApp session");
                    }
                    delay
                },
                CloseAction::Terminal { reason, attempts } => {
                    self.report_failure(reason, attempts);
                    break;
                },
            };
            self.publish();

            match self.wait(delay).await {
                Wait::Elapsed => {},
                Wait::Cancelled => break,
                Wait::Logout => {
                    self.logged_out();
                    break;
                },
            }
        }

        self.abort_roster();
        self.machine.stop();
        self.publish();
        debug!("WhatsApp connection driver stopped");
    }

    async fn pump(&mut self, rx: &mut mpsc::Receiver<TransportEvent>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                Some(Command::Logout) = self.commands.recv() => return SessionEnd::Logout,
                event = rx.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Closed(CloseReason::transient("transport event stream ended"));
                    };
                    if let Some(reason) = self.handle(event).await {
                        return SessionEnd::Closed(reason);
                    }
                },
            }
        }
    }

    async fn handle(&mut self, event: TransportEvent) -> Option<CloseReason> {
        match event {
            TransportEvent::ConnectionUpdate(update) => return self.on_update(update),
            TransportEvent::MessageBatch(messages) => {
                self.forward(InboundEvent::Messages(messages)).await;
            },
            TransportEvent::GroupDeltas(updates) => {
                self.forward(InboundEvent::GroupDeltas(updates)).await;
            },
            TransportEvent::GroupUpserts(groups) => {
                self.forward(InboundEvent::GroupUpserts(groups)).await;
            },
        }
        None
    }

    fn on_update(&mut self, update: ConnectionUpdate) -> Option<CloseReason> {
        if let Some(qr) = update.qr {
            self.machine.on_credential_required();
            self.publish();
            info!("WhatsApp pairing required, scan the QR code");
            emit(&self.events, WatchEvent::CredentialRequired { qr });
        }
        match update.connection {
            Some(LinkState::Open) => {
                if self.machine.on_open() {
                    self.publish();
                    info!("WhatsApp connection ready");
                    emit(&self.events, WatchEvent::ConnectionReady);
                    self.schedule_roster_fetch();
                }
                None
            },
            Some(LinkState::Close) => Some(update.close_reason.unwrap_or_default()),
            Some(LinkState::Connecting) | None => None,
        }
    }

    async fn forward(&self, event: InboundEvent) {
        if self.inbound.send(event).await.is_err() {
            debug!("inbound receiver dropped");
        }
    }

    /// Fetch the roster after a short delay without holding up the session.
    fn schedule_roster_fetch(&mut self) {
        self.abort_roster();
        let transport = Arc::clone(&self.transport);
        let inbound = self.inbound.clone();
        let delay = self.settings.roster_fetch_delay;
        self.roster = Some(tokio::spawn(async move {
            sleep(delay).await;
            match transport.fetch_all_groups().await {
                Ok(groups) => {
                    info!(count = groups.len(), "loaded WhatsApp group roster");
                    if inbound.send(InboundEvent::GroupsLoaded(groups)).await.is_err() {
                        debug!("inbound receiver dropped before roster delivery");
                    }
                },
                Err(e) => warn!(error = %e, "failed to fetch WhatsApp group roster"),
            }
        }));
    }

    fn abort_roster(&mut self) {
        if let Some(task) = self.roster.take() {
            task.abort();
        }
    }

    async fn wait(&mut self, delay: Duration) -> Wait {
        tokio::select! {
            _ = self.cancel.cancelled() => Wait::Cancelled,
            Some(Command::Logout) = self.commands.recv() => Wait::Logout,
            _ = sleep(delay) => Wait::Elapsed,
        }
    }

    fn logged_out(&mut self) {
        if let CloseAction::Terminal { reason, attempts } = self.machine.logout() {
            self.report_failure(reason, attempts);
        }
    }

    fn report_failure(&mut self, reason: ConnectionFailure, attempts: u32) {
        self.publish();
        error!(?reason, attempts, "WhatsApp connection failed permanently");
        emit(&self.events, WatchEvent::ConnectionFailed { reason, attempts });
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.machine.snapshot());
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU32, Ordering},
    };

    use {
        async_trait::async_trait,
        tokio::{sync::mpsc::UnboundedReceiver, time::Instant},
    };

    use {
        super::*,
        crate::error::{Error, Result},
    };

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(30), 3),
            conflict_delay: Duration::from_secs(2),
            roster_fetch_delay: Duration::from_secs(2),
        }
    }

    fn transient() -> CloseReason {
        CloseReason::new(Some(428), "Connection Closed")
    }

    // ── Pure machine ────────────────────────────────────────────────────

    #[test]
    fn transient_closes_back_off_then_give_up() {
        let mut machine = ConnectionMachine::new(&settings());
        let mut delays = Vec::new();
        loop {
            assert!(machine.begin_connect());
            match machine.on_close(&transient()) {
                CloseAction::Reconnect { delay, attempt } => {
                    assert!(attempt <= machine.max_attempts());
                    delays.push(delay.as_secs());
                },
                CloseAction::Terminal { reason, attempts } => {
                    assert_eq!(reason, ConnectionFailure::AttemptsExhausted);
                    assert_eq!(attempts, 3);
                    break;
                },
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, vec![5, 10, 20]);
        assert_eq!(machine.state(), ConnectionState::FailedPermanently);
        assert!(!machine.begin_connect());
    }

    #[test]
    fn open_resets_attempts() {
        let mut machine = ConnectionMachine::new(&settings());
        machine.begin_connect();
        machine.on_close(&transient());
        machine.begin_connect();
        machine.on_close(&transient());
        assert_eq!(machine.reconnect_attempts(), 2);

        machine.begin_connect();
        machine.on_credential_required();
        assert_eq!(machine.state(), ConnectionState::AwaitingCredential);
        assert!(machine.on_open());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert!(!machine.on_open());
    }

    #[test]
    fn logged_out_is_terminal_and_sticky() {
        let mut machine = ConnectionMachine::new(&settings());
        machine.begin_connect();
        machine.on_open();
        let action = machine.on_close(&CloseReason::new(Some(401), "logged out"));
        assert_eq!(action, CloseAction::Terminal {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0
        });
        let again = machine.on_close(&transient());
        assert_eq!(again, action);
        machine.stop();
        assert_eq!(machine.state(), ConnectionState::FailedPermanently);
    }

    #[test]
    fn logout_while_connected_disconnects_then_fails() {
        let mut machine = ConnectionMachine::new(&settings());
        machine.begin_connect();
        machine.on_open();
        assert_eq!(machine.logout(), CloseAction::Terminal {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0
        });
        assert_eq!(machine.state(), ConnectionState::FailedPermanently);
        assert!(!machine.begin_connect());
        assert!(!machine.on_open());

        // A transient close that arrives afterwards keeps the logout reason.
        assert_eq!(machine.on_close(&transient()), CloseAction::Terminal {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0
        });
    }

    #[test]
    fn conflict_resets_session_without_counting() {
        let mut machine = ConnectionMachine::new(&settings());
        machine.begin_connect();
        machine.on_close(&transient());
        machine.begin_connect();
        let action = machine.on_close(&CloseReason::new(Some(440), "Stream Errored (conflict)"));
        assert_eq!(action, CloseAction::ResetSession {
            delay: Duration::from_secs(2)
        });
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    // ── Driver ──────────────────────────────────────────────────────────

    /// Each `connect` plays the next script; with no scripts left it fails.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Vec<TransportEvent>>>,
        live: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        connect_times: Mutex<Vec<Instant>>,
        groups: Mutex<Vec<GroupInfo>>,
        fail_groups: AtomicBool,
        logouts: AtomicU32,
        closes: AtomicU32,
        clears: AtomicU32,
    }

    impl ScriptedTransport {
        fn with_scripts(scripts: Vec<Vec<TransportEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn connect_offsets(&self, start: Instant) -> Vec<u64> {
            self.connect_times
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.duration_since(start).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
            self.connect_times.lock().unwrap().push(Instant::now());
            let script = self.scripts.lock().unwrap().pop_front();
            let Some(script) = script else {
                return Err(Error::message("connection refused"));
            };
            for event in script {
                events.send(event).await.unwrap();
            }
            *self.live.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn fetch_all_groups(&self) -> Result<Vec<GroupInfo>> {
            if self.fail_groups.load(Ordering::SeqCst) {
                return Err(Error::message("roster unavailable"));
            }
            Ok(self.groups.lock().unwrap().clone())
        }

        async fn logout(&self) -> Result<()> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn clear_session(&self) -> Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        handle: ConnectionHandle,
        inbound: mpsc::Receiver<InboundEvent>,
        events: UnboundedReceiver<WatchEvent>,
    }

    fn start(transport: Arc<ScriptedTransport>) -> Harness {
        let (inbound_tx, inbound) = mpsc::channel(16);
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = spawn_connection(transport, settings(), inbound_tx, events_tx);
        Harness {
            handle,
            inbound,
            events,
        }
    }

    fn open() -> TransportEvent {
        TransportEvent::ConnectionUpdate(ConnectionUpdate::open())
    }

    fn close(reason: CloseReason) -> TransportEvent {
        TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(reason))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_reconnects_with_backoff() {
        let started = Instant::now();
        let transport = ScriptedTransport::with_scripts(vec![]);
        let mut h = start(Arc::clone(&transport));

        let event = h.events.recv().await.unwrap();
        assert_eq!(event, WatchEvent::ConnectionFailed {
            reason: ConnectionFailure::AttemptsExhausted,
            attempts: 3,
        });
        assert_eq!(transport.connect_offsets(started), vec![0, 5, 15, 35]);

        h.handle.shutdown().await;
        assert_eq!(
            h.handle.snapshot().state,
            ConnectionState::FailedPermanently
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn open_emits_ready_and_loads_roster() {
        let transport = ScriptedTransport::with_scripts(vec![vec![open()]]);
        *transport.groups.lock().unwrap() = vec![GroupInfo {
            id: "1@g.us".into(),
            subject: Some("Southern Flights".into()),
            participants: 12,
        }];
        let mut h = start(Arc::clone(&transport));

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionReady);
        assert_eq!(h.handle.snapshot().state, ConnectionState::Connected);

        match h.inbound.recv().await.unwrap() {
            InboundEvent::GroupsLoaded(groups) => assert_eq!(groups[0].display_name(), "Southern Flights"),
            other => panic!("unexpected {other:?}"),
        }

        h.handle.shutdown().await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.snapshot().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_transient_close_resets_attempts() {
        let started = Instant::now();
        let transport =
            ScriptedTransport::with_scripts(vec![vec![close(transient())], vec![open()]]);
        let mut h = start(Arc::clone(&transport));

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionReady);
        assert_eq!(transport.connect_offsets(started), vec![0, 5]);
        assert_eq!(h.handle.snapshot().reconnect_attempts, 0);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_close_stops_without_reconnect() {
        let transport = ScriptedTransport::with_scripts(vec![vec![
            open(),
            close(CloseReason::new(Some(401), "Connection Failure")),
        ]]);
        let mut h = start(Arc::clone(&transport));

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionReady);
        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionFailed {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0,
        });
        h.handle.shutdown().await;
        assert_eq!(transport.connect_times.lock().unwrap().len(), 1);
        assert_eq!(transport.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_clears_session_and_reconnects() {
        let started = Instant::now();
        let transport = ScriptedTransport::with_scripts(vec![
            vec![close(CloseReason::new(Some(440), "conflict"))],
            vec![open()],
        ]);
        let mut h = start(Arc::clone(&transport));

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionReady);
        assert_eq!(transport.clears.load(Ordering::SeqCst), 1);
        assert_eq!(transport.connect_offsets(started), vec![0, 2]);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn qr_requests_credentials() {
        let transport = ScriptedTransport::with_scripts(vec![vec![TransportEvent::ConnectionUpdate(
            ConnectionUpdate::qr("2@abc"),
        )]]);
        let mut h = start(transport);

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::CredentialRequired {
            qr: "2@abc".into()
        });
        assert_eq!(
            h.handle.snapshot().state,
            ConnectionState::AwaitingCredential
        );
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_messages_and_group_changes() {
        let transport = ScriptedTransport::with_scripts(vec![vec![
            open(),
            TransportEvent::MessageBatch(vec![RawMessage::default()]),
            TransportEvent::GroupDeltas(vec![GroupUpdate {
                id: "1@g.us".into(),
                subject: Some("Renamed".into()),
                participants: None,
            }]),
        ]]);
        transport.fail_groups.store(true, Ordering::SeqCst);
        let mut h = start(transport);

        assert!(matches!(
            h.inbound.recv().await.unwrap(),
            InboundEvent::Messages(m) if m.len() == 1
        ));
        assert!(matches!(
            h.inbound.recv().await.unwrap(),
            InboundEvent::GroupDeltas(_)
        ));

        // A failed roster fetch leaves the connection up.
        sleep(Duration::from_secs(5)).await;
        assert!(h.inbound.try_recv().is_err());
        assert_eq!(h.handle.snapshot().state, ConnectionState::Connected);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logout_unlinks_and_fails() {
        let transport = ScriptedTransport::with_scripts(vec![vec![open()]]);
        let mut h = start(Arc::clone(&transport));

        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionReady);
        h.handle.logout();
        assert_eq!(h.events.recv().await.unwrap(), WatchEvent::ConnectionFailed {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0,
        });
        h.handle.shutdown().await;
        assert_eq!(transport.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.handle.snapshot().state,
            ConnectionState::FailedPermanently
        );
    }
}
