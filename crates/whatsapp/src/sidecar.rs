//! WebSocket client for the Baileys sidecar.
//!
//! The sidecar speaks JSON text frames tagged by `type`. Outbound:
//! `login`, `logout`, `close`, `fetch_groups`. Inbound: `connection_update`,
//! `messages`, `groups_update`, `groups_upsert`, `groups` (reply to
//! `fetch_groups`) and `error`.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    milesguard_common::GroupInfo,
    milesguard_config::WhatsAppConfig,
    serde::{Deserialize, Serialize},
    tokio::sync::{mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    error::{Error, Result},
    session::SessionDir,
    transport::Transport,
    types::{CloseReason, ConnectionUpdate, GroupUpdate, RawMessage, TransportEvent},
};

pub const DEFAULT_SIDECAR_PORT: u16 = 18790;

type GroupsReply = std::result::Result<Vec<GroupInfo>, String>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<GroupsReply>>>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Login { auth_dir: &'a Path },
    Logout,
    Close,
    FetchGroups { request_id: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    ConnectionUpdate(ConnectionUpdate),
    Messages {
        messages: Vec<RawMessage>,
    },
    GroupsUpdate {
        updates: Vec<GroupUpdate>,
    },
    GroupsUpsert {
        groups: Vec<GroupInfo>,
    },
    Groups {
        request_id: String,
        groups: Vec<GroupInfo>,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        message: String,
    },
}

pub struct SidecarTransport {
    url: String,
    session: SessionDir,
    request_timeout: Duration,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
}

impl SidecarTransport {
    pub fn new(port: u16, session: SessionDir, request_timeout: Duration) -> Self {
        Self {
            url: format!("ws://127.0.0.1:{port}"),
            session,
            request_timeout,
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self::new(
            config.sidecar_port,
            SessionDir::new(&config.session_dir),
            config.request_timeout(),
        )
    }

    pub fn session(&self) -> &SessionDir {
        &self.session
    }

    fn send(&self, frame: &OutboundFrame<'_>) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .as_ref()
            .ok_or(Error::NotConnected)?
            .send(json)
            .map_err(|_| Error::NotConnected)
    }

    fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.session.ensure().await?;

        let (ws, _) = tokio::time::timeout(self.request_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::timeout("sidecar connect", self.request_timeout))??;
        info!(url = %self.url, "connected to WhatsApp sidecar");
        let (mut sink, mut stream) = ws.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = write_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "sidecar write failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "sidecar socket close failed");
            }
        });
        // Replacing the writer closes any previous socket.
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(write_tx);

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if !route(&text, &events, &pending).await {
                            return;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let message = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "sidecar closed the socket".into());
                        break CloseReason::transient(message);
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break CloseReason::transient(format!("sidecar socket error: {e}")),
                    None => break CloseReason::transient("sidecar socket ended"),
                }
            };
            fail_pending(&pending, &reason.message);
            let closed = TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(reason));
            if events.send(closed).await.is_err() {
                debug!("session already ended, dropping sidecar close");
            }
        });

        self.send(&OutboundFrame::Login {
            auth_dir: self.session.path(),
        })
    }

    async fn fetch_all_groups(&self) -> Result<Vec<GroupInfo>> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);

        if let Err(e) = self.send(&OutboundFrame::FetchGroups {
            request_id: &request_id,
        }) {
            self.forget(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(groups))) => Ok(groups),
            Ok(Ok(Err(message))) => Err(Error::Sidecar(message)),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.forget(&request_id);
                Err(Error::timeout("fetch_groups", self.request_timeout))
            },
        }
    }

    async fn logout(&self) -> Result<()> {
        self.send(&OutboundFrame::Logout)
    }

    async fn close(&self) -> Result<()> {
        let sent = self.send(&OutboundFrame::Close);
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sent {
            Err(Error::NotConnected) => Ok(()),
            other => other,
        }
    }

    async fn clear_session(&self) -> Result<()> {
        self.session.clear().await
    }
}

/// Dispatch one inbound frame. Returns `false` once the session is gone.
async fn route(text: &str, events: &mpsc::Sender<TransportEvent>, pending: &Pending) -> bool {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "ignoring malformed sidecar frame");
            return true;
        },
    };
    let event = match frame {
        InboundFrame::ConnectionUpdate(update) => TransportEvent::ConnectionUpdate(update),
        InboundFrame::Messages { messages } => TransportEvent::MessageBatch(messages),
        InboundFrame::GroupsUpdate { updates } => TransportEvent::GroupDeltas(updates),
        InboundFrame::GroupsUpsert { groups } => TransportEvent::GroupUpserts(groups),
        InboundFrame::Groups { request_id, groups } => {
            resolve(pending, &request_id, Ok(groups));
            return true;
        },
        InboundFrame::Error {
            request_id: Some(request_id),
            message,
        } => {
            resolve(pending, &request_id, Err(message));
            return true;
        },
        InboundFrame::Error {
            request_id: None,
            message,
        } => {
            warn!(%message, "sidecar reported an error");
            return true;
        },
    };
    events.send(event).await.is_ok()
}

fn resolve(pending: &Pending, request_id: &str, reply: GroupsReply) {
    let waiter = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(request_id);
    match waiter {
        Some(tx) => {
            if tx.send(reply).is_err() {
                debug!(request_id, "group request caller went away");
            }
        },
        None => debug!(request_id, "reply for unknown sidecar request"),
    }
}

fn fail_pending(pending: &Pending, message: &str) {
    let waiters: Vec<_> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(message.to_string()));
    }
}
