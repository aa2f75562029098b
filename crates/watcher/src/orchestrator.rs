//! Wires inbound transport traffic through dedup, group resolution and the
//! filter, then hands relevant messages to the dispatcher.
//!
//! Stage one (validation, normalization, dedup, group check) runs for every
//! raw message. Stage two needs the group name and drops the message when
//! the group is not known yet; there is no buffering.

use std::{collections::HashMap, sync::Arc};

use {
    chrono::Utc,
    milesguard_common::{
        EventSender, GroupInfo, NormalizedMessage, RelevantMessage, WatchEvent, emit,
    },
    milesguard_dispatch::DispatchManager,
    milesguard_filter::{FilterEngine, FilterReason},
    milesguard_whatsapp::{GroupUpdate, InboundEvent, RawMessage},
    serde::Serialize,
    tokio::{
        sync::{mpsc, watch},
        task::JoinSet,
    },
    tracing::{debug, info, warn},
};

use crate::dedup::DedupCache;

/// Why a raw message never reached the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Missing message id or conversation id.
    Invalid,
    /// Protocol frame rather than user content.
    System,
    EmptyText,
    Duplicate,
    NotGroup,
    /// Group metadata not loaded yet.
    UnknownGroup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Dropped(DropReason),
    Filtered(FilterReason),
    Relevant(RelevantMessage),
}

/// Counters published after every inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorSnapshot {
    pub known_groups: usize,
    pub target_groups: usize,
    pub received: u64,
    pub relevant: u64,
    pub dropped: HashMap<DropReason, u64>,
}

pub struct Orchestrator {
    dedup: Arc<DedupCache>,
    filter: Arc<FilterEngine>,
    dispatcher: Arc<DispatchManager>,
    events: EventSender,
    groups: HashMap<String, GroupInfo>,
    dispatches: JoinSet<()>,
    snapshot: OrchestratorSnapshot,
    status: watch::Sender<OrchestratorSnapshot>,
}

impl Orchestrator {
    pub fn new(
        dedup: Arc<DedupCache>,
        filter: Arc<FilterEngine>,
        dispatcher: Arc<DispatchManager>,
        events: EventSender,
    ) -> Self {
        let (status, _) = watch::channel(OrchestratorSnapshot::default());
        Self {
            dedup,
            filter,
            dispatcher,
            events,
            groups: HashMap::new(),
            dispatches: JoinSet::new(),
            snapshot: OrchestratorSnapshot::default(),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorSnapshot> {
        self.status.subscribe()
    }

    pub fn group(&self, id: &str) -> Option<&GroupInfo> {
        self.groups.get(id)
    }

    pub fn known_groups(&self) -> usize {
        self.groups.len()
    }

    /// Process inbound events until the sender side closes, then wait for
    /// in-flight dispatches.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            self.handle(event);
        }
        debug!("inbound stream closed");
        self.flush().await;
    }

    pub fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Messages(messages) => {
                for raw in &messages {
                    self.process(raw);
                }
            },
            InboundEvent::GroupsLoaded(groups) => self.load_groups(groups),
            InboundEvent::GroupUpserts(groups) => {
                for group in groups {
                    debug!(group_id = %group.id, name = group.display_name(), "group added");
                    self.groups.insert(group.id.clone(), group);
                }
            },
            InboundEvent::GroupDeltas(updates) => {
                for update in updates {
                    self.apply_delta(update);
                }
            },
        }
        self.reap();
        self.publish();
    }

    /// Run one raw message through both stages, spawning its dispatch when
    /// relevant.
    pub fn process(&mut self, raw: &RawMessage) -> Processed {
        let processed = match self.accept(raw) {
            Ok(message) => self.evaluate(message),
            Err(reason) => Processed::Dropped(reason),
        };
        match &processed {
            Processed::Dropped(reason) => {
                *self.snapshot.dropped.entry(*reason).or_default() += 1;
                debug!(message_id = raw.id().unwrap_or_default(), ?reason, "message dropped");
            },
            Processed::Filtered(reason) => {
                debug!(message_id = raw.id().unwrap_or_default(), ?reason, "message filtered out");
            },
            Processed::Relevant(relevant) => self.publish_relevant(relevant.clone()),
        }
        processed
    }

    /// Stage one: validate, normalize, dedup, require a group conversation.
    fn accept(&mut self, raw: &RawMessage) -> Result<NormalizedMessage, DropReason> {
        let (Some(id), Some(conversation_id)) = (raw.id(), raw.conversation_id()) else {
            return Err(DropReason::Invalid);
        };
        match &raw.message {
            Some(content) if !content.is_protocol_frame() => {},
            _ => return Err(DropReason::System),
        }
        if raw.text().is_none_or(|t| t.trim().is_empty()) {
            return Err(DropReason::EmptyText);
        }
        let message = NormalizedMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            conversation_name: None,
            sender_name: raw.sender_name(),
            text: raw.text().unwrap_or_default().to_string(),
            received_at: raw.timestamp().unwrap_or_else(Utc::now),
        };

        let fingerprint = self.dedup.fingerprint(&message);
        if !self.dedup.check_and_insert(fingerprint) {
            return Err(DropReason::Duplicate);
        }
        if !raw.is_group() {
            return Err(DropReason::NotGroup);
        }

        self.snapshot.received += 1;
        emit(&self.events, WatchEvent::MessageReceived {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
        });
        Ok(message)
    }

    /// Stage two: resolve the group name and run the filter.
    fn evaluate(&mut self, message: NormalizedMessage) -> Processed {
        let Some(group) = self.groups.get(&message.conversation_id) else {
            return Processed::Dropped(DropReason::UnknownGroup);
        };
        let message = message.with_conversation_name(group.display_name());
        let decision = self.filter.decide(message.conversation_name(), &message.text);
        if !decision.should_process {
            return Processed::Filtered(decision.reason);
        }
        Processed::Relevant(RelevantMessage::new(message, decision.matched_keywords))
    }

    fn publish_relevant(&mut self, relevant: RelevantMessage) {
        self.snapshot.relevant += 1;
        info!(
            message_id = relevant.id(),
            group = relevant.message.conversation_name(),
            sender = %relevant.message.sender_name,
            keywords = ?relevant.matched_keywords,
            "relevant message"
        );
        emit(&self.events, WatchEvent::MessageRelevant {
            message: relevant.clone(),
        });

        let dispatcher = Arc::clone(&self.dispatcher);
        self.dispatches.spawn(async move {
            dispatcher.dispatch(relevant).await;
        });
    }

    fn load_groups(&mut self, groups: Vec<GroupInfo>) {
        self.groups = groups.into_iter().map(|g| (g.id.clone(), g)).collect();
        let targets = self
            .groups
            .values()
            .filter(|g| self.filter.is_target_conversation(g.display_name()))
            .count();
        info!(groups = self.groups.len(), targets, "group roster loaded");
        if targets == 0 {
            warn!("no joined group matches the configured target groups");
        }
    }

    /// Updates only touch groups already in the roster; new groups arrive
    /// through upserts.
    fn apply_delta(&mut self, update: GroupUpdate) {
        let Some(group) = self.groups.get_mut(&update.id) else {
            debug!(group_id = %update.id, "update for unknown group ignored");
            return;
        };
        if let Some(subject) = update.subject {
            debug!(group_id = %update.id, %subject, "group renamed");
            group.subject = Some(subject);
        }
        if let Some(participants) = update.participants {
            group.participants = participants;
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.dispatches.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "dispatch task failed");
            }
        }
    }

    fn publish(&mut self) {
        self.snapshot.known_groups = self.groups.len();
        self.snapshot.target_groups = self
            .groups
            .values()
            .filter(|g| self.filter.is_target_conversation(g.display_name()))
            .count();
        self.status.send_replace(self.snapshot.clone());
    }

    /// Wait for spawned dispatches to finish, up to the dispatcher's
    /// shutdown timeout. Dispatches still running after that are aborted.
    pub async fn flush(&mut self) {
        let limit = self.dispatcher.settings().shutdown_timeout;
        let drain = async {
            while let Some(result) = self.dispatches.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "dispatch task failed");
                }
            }
        };
        if tokio::time::timeout(limit, drain).await.is_err() {
            warn!(
                pending = self.dispatches.len(),
                "in-flight dispatches did not finish in time, aborting them"
            );
            self.dispatches.abort_all();
            while self.dispatches.join_next().await.is_some() {}
        }
        self.publish();
    }
}
