//! Per-document session controller.
//!
//! One live document owns one [`Hub`] task. Every mutation of content,
//! version, and the participant set happens on that task; attach,
//! detach, and submitted operations arrive through a single merged
//! inbox, so no locks guard session state. Outbound sends never block:
//! a participant whose queue is full is evicted so one slow client
//! cannot stall the document.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{SessionCache, SessionState};
use crate::operation::Operation;
use crate::protocol::ServerFrame;
use crate::registry::{Registry, RegistryConfig};
use crate::store::Store;

/// Identifies one attached socket, freshly generated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An attached connection as the controller sees it: an identity and a
/// bounded outbound queue of server frames.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: String,
    pub frames: mpsc::Sender<ServerFrame>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, frames: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id: ParticipantId::new(),
            user_id: user_id.into(),
            frames,
        }
    }
}

#[derive(Debug, Error)]
#[error("session controller closed")]
pub struct HubClosed;

enum HubEvent {
    Attach(Participant),
    Detach(ParticipantId),
    Submit { from: ParticipantId, op: Operation },
}

/// Cheap cloneable handle used to talk to a controller task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    document_id: Arc<str>,
    events: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// True once the controller task has stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    pub(crate) fn same_channel(&self, other: &HubHandle) -> bool {
        self.events.same_channel(&other.events)
    }

    pub async fn attach(&self, participant: Participant) -> Result<(), HubClosed> {
        self.events
            .send(HubEvent::Attach(participant))
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn detach(&self, id: ParticipantId) -> Result<(), HubClosed> {
        self.events
            .send(HubEvent::Detach(id))
            .await
            .map_err(|_| HubClosed)
    }

    pub async fn submit(&self, from: ParticipantId, op: Operation) -> Result<(), HubClosed> {
        self.events
            .send(HubEvent::Submit { from, op })
            .await
            .map_err(|_| HubClosed)
    }
}

pub(crate) struct Hub {
    document_id: String,
    content: String,
    version: u64,
    participants: HashMap<ParticipantId, mpsc::Sender<ServerFrame>>,
    events: mpsc::Receiver<HubEvent>,
    self_handle: HubHandle,
    store: Arc<dyn Store>,
    cache: Arc<dyn SessionCache>,
    registry: Weak<Registry>,
    config: RegistryConfig,
}

impl Hub {
    /// Starts the controller task and returns its handle.
    pub(crate) fn spawn(
        document_id: String,
        state: SessionState,
        store: Arc<dyn Store>,
        cache: Arc<dyn SessionCache>,
        registry: Weak<Registry>,
        config: RegistryConfig,
    ) -> HubHandle {
        let (events_tx, events_rx) = mpsc::channel(config.inbox_capacity);
        let handle = HubHandle {
            document_id: Arc::from(document_id.as_str()),
            events: events_tx,
        };
        let hub = Hub {
            document_id,
            content: state.content,
            version: state.version,
            participants: HashMap::new(),
            events: events_rx,
            self_handle: handle.clone(),
            store,
            cache,
            registry,
            config,
        };
        tokio::spawn(hub.run());
        handle
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::Attach(participant) => self.handle_attach(participant),
                HubEvent::Detach(id) => {
                    self.handle_detach(id);
                    if self.participants.is_empty() {
                        self.drain().await;
                        return;
                    }
                }
                HubEvent::Submit { from, op } => self.handle_submit(from, op).await,
            }
        }
    }

    fn handle_attach(&mut self, participant: Participant) {
        let frame = ServerFrame::InitialState {
            content: self.content.clone(),
            version: self.version,
        };
        match participant.frames.try_send(frame) {
            Ok(()) => {
                debug!(
                    document_id = %self.document_id,
                    participant = %participant.id,
                    user_id = %participant.user_id,
                    "participant attached"
                );
                self.participants.insert(participant.id, participant.frames);
            }
            Err(_) => warn!(
                document_id = %self.document_id,
                participant = %participant.id,
                "participant evicted on attach: outbound queue unavailable"
            ),
        }
    }

    fn handle_detach(&mut self, id: ParticipantId) {
        if self.participants.remove(&id).is_some() {
            debug!(document_id = %self.document_id, participant = %id, "participant detached");
        }
    }

    async fn handle_submit(&mut self, from: ParticipantId, op: Operation) {
        if op.is_undo() {
            self.handle_undo(from).await;
            return;
        }

        // Server is authoritative: a stale basis version means the
        // client resyncs from canonical state, no transform is attempted.
        if op.basis_version() != self.version {
            debug!(
                document_id = %self.document_id,
                participant = %from,
                basis = op.basis_version(),
                current = self.version,
                "version conflict"
            );
            self.send_to(
                from,
                ServerFrame::OutOfSync {
                    content: self.content.clone(),
                    version: self.version,
                },
            );
            return;
        }

        let mut op = op;
        if let Err(err) = op.capture_delete_text(&self.content) {
            self.send_to(from, ServerFrame::error(err.to_string()));
            return;
        }
        let next = match op.apply(&self.content) {
            Ok(next) => next,
            Err(err) => {
                debug!(document_id = %self.document_id, %err, "operation rejected");
                self.send_to(from, ServerFrame::error(err.to_string()));
                return;
            }
        };

        self.content = next;
        self.version += 1;
        op.stamp(self.version);

        self.record_op(&op).await;
        self.write_through().await;
        self.broadcast(ServerFrame::Operation { op }, Some(from));
    }

    async fn handle_undo(&mut self, from: ParticipantId) {
        let popped = match timeout(
            self.config.external_timeout,
            self.cache.pop_op(&self.document_id),
        )
        .await
        {
            Ok(Ok(popped)) => popped,
            Ok(Err(err)) => {
                warn!(document_id = %self.document_id, %err, "undo log pop failed");
                self.send_to(from, ServerFrame::error("undo unavailable"));
                return;
            }
            Err(_) => {
                warn!(document_id = %self.document_id, "undo log pop timed out");
                self.send_to(from, ServerFrame::error("undo unavailable"));
                return;
            }
        };

        let Some(encoded) = popped else {
            self.send_to(from, ServerFrame::error("nothing to undo"));
            return;
        };

        let recorded: Operation = match serde_json::from_slice(&encoded) {
            Ok(op) => op,
            Err(err) => {
                warn!(document_id = %self.document_id, %err, "skipping undecodable undo entry");
                return;
            }
        };
        let mut inverted = match recorded.invert() {
            Ok(inverted) => inverted,
            Err(err) => {
                warn!(document_id = %self.document_id, %err, "skipping uninvertible undo entry");
                return;
            }
        };
        if inverted.is_noop() {
            warn!(
                document_id = %self.document_id,
                "skipping undo entry without captured text"
            );
            return;
        }

        // The entry was validated when first accepted; clamping is a
        // last-resort defense, not a correctness path.
        self.content = inverted.apply_clamped(&self.content);
        self.version += 1;
        inverted.stamp(self.version);

        self.write_through().await;
        // Undos are not local echoes: everyone, submitter included,
        // applies the compensating operation.
        self.broadcast(ServerFrame::Operation { op: inverted }, None);
    }

    /// Appends an accepted operation to the cache-backed undo log.
    /// Failures are logged and non-fatal: in-memory state is the source
    /// of truth.
    async fn record_op(&self, op: &Operation) {
        let encoded = match serde_json::to_vec(op) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(document_id = %self.document_id, %err, "failed to encode operation");
                return;
            }
        };
        match timeout(
            self.config.external_timeout,
            self.cache.push_op(&self.document_id, &encoded),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(document_id = %self.document_id, %err, "undo log push failed")
            }
            Err(_) => warn!(document_id = %self.document_id, "undo log push timed out"),
        }
    }

    async fn write_through(&self) {
        match timeout(
            self.config.external_timeout,
            self.cache
                .set_state(&self.document_id, &self.content, self.version),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(document_id = %self.document_id, %err, "cache write-through failed")
            }
            Err(_) => warn!(document_id = %self.document_id, "cache write-through timed out"),
        }
    }

    fn send_to(&mut self, id: ParticipantId, frame: ServerFrame) {
        if let Some(tx) = self.participants.get(&id) {
            if tx.try_send(frame).is_err() {
                self.evict(id);
            }
        }
    }

    fn broadcast(&mut self, frame: ServerFrame, exclude: Option<ParticipantId>) {
        let mut lagging = Vec::new();
        for (id, tx) in &self.participants {
            if Some(*id) == exclude {
                continue;
            }
            if tx.try_send(frame.clone()).is_err() {
                lagging.push(*id);
            }
        }
        for id in lagging {
            self.evict(id);
        }
    }

    fn evict(&mut self, id: ParticipantId) {
        if self.participants.remove(&id).is_some() {
            warn!(
                document_id = %self.document_id,
                participant = %id,
                "participant evicted: outbound queue full or closed"
            );
        }
    }

    /// Terminal path after the last participant departs: persist the
    /// final state, clear the session cache, deregister, stop.
    async fn drain(&mut self) {
        self.events.close();

        let mut saved = false;
        for attempt in 1..=self.config.flush_retries {
            match timeout(
                self.config.external_timeout,
                self.store
                    .save_document(&self.document_id, &self.content, self.version),
            )
            .await
            {
                Ok(Ok(())) => {
                    saved = true;
                    break;
                }
                Ok(Err(err)) => {
                    warn!(document_id = %self.document_id, attempt, %err, "final save failed")
                }
                Err(_) => {
                    warn!(document_id = %self.document_id, attempt, "final save timed out")
                }
            }
            if attempt < self.config.flush_retries {
                sleep(self.config.flush_backoff).await;
            }
        }
        if !saved {
            error!(
                document_id = %self.document_id,
                version = self.version,
                "terminating session without durable save"
            );
        }

        // The cache is a session artifact, not a durability layer: clear
        // it even when the save did not go through.
        match timeout(
            self.config.external_timeout,
            self.cache.clear_state(&self.document_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(document_id = %self.document_id, %err, "cache clear failed")
            }
            Err(_) => warn!(document_id = %self.document_id, "cache clear timed out"),
        }

        if let Some(registry) = self.registry.upgrade() {
            registry
                .remove_hub(&self.document_id, &self.self_handle)
                .await;
        }
        info!(
            document_id = %self.document_id,
            version = self.version,
            "session controller terminated"
        );
    }
}
