//! Process-wide index of live session controllers.
//!
//! Guarantees at-most-one controller per document in this process. The
//! map mutex is the only lock in the core; hydration I/O runs under it,
//! which is acceptable because contention is document-scoped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cache::{SessionCache, SessionState};
use crate::hub::{Hub, HubHandle, Participant, ParticipantId};
use crate::protocol::ServerFrame;
use crate::store::{Store, StoreError};

/// Connection-time failures, mapped to HTTP statuses by the transport.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("document id is required")]
    BadRequest,

    #[error("forbidden")]
    Forbidden,

    #[error("document not found")]
    NotFound,

    #[error("internal error")]
    Internal,
}

/// Tunables shared by the registry and its controllers.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each participant's outbound frame queue.
    pub outbound_capacity: usize,
    /// Capacity of each controller's merged inbox.
    pub inbox_capacity: usize,
    /// Bound on every store and cache round trip.
    pub external_timeout: Duration,
    /// Attempts for the terminal flush.
    pub flush_retries: u32,
    pub flush_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbox_capacity: 256,
            external_timeout: Duration::from_secs(5),
            flush_retries: 3,
            flush_backoff: Duration::from_millis(100),
        }
    }
}

/// A participant successfully joined to a controller: its identity, the
/// receive side of its outbound queue, and the controller handle used
/// to submit operations and detach.
pub struct Attached {
    pub participant_id: ParticipantId,
    pub frames: mpsc::Receiver<ServerFrame>,
    pub hub: HubHandle,
}

pub struct Registry {
    hubs: Mutex<HashMap<String, HubHandle>>,
    store: Arc<dyn Store>,
    cache: Arc<dyn SessionCache>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn SessionCache>) -> Arc<Self> {
        Self::with_config(store, cache, RegistryConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn Store>,
        cache: Arc<dyn SessionCache>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hubs: Mutex::new(HashMap::new()),
            store,
            cache,
            config,
        })
    }

    /// Validates a connection request and ensures a live controller for
    /// the document, hydrating it from cache or store if needed. Called
    /// before the socket upgrade so failures still map to HTTP statuses.
    pub async fn connect(
        self: &Arc<Self>,
        document_id: &str,
        user_id: &str,
    ) -> Result<HubHandle, ConnectError> {
        if user_id.is_empty() {
            return Err(ConnectError::Unauthorized);
        }
        if document_id.is_empty() {
            return Err(ConnectError::BadRequest);
        }

        let allowed = timeout(
            self.config.external_timeout,
            self.store.check_permission(document_id, user_id),
        )
        .await
        .map_err(|_| {
            warn!(document_id, "permission check timed out");
            ConnectError::Internal
        })?
        .map_err(|err| {
            error!(document_id, %err, "permission check failed");
            ConnectError::Internal
        })?;
        if !allowed {
            return Err(ConnectError::Forbidden);
        }

        self.get_or_create(document_id).await
    }

    /// Attaches a new participant to the document's controller. Retries
    /// once through `get_or_create` in case the controller terminated
    /// between lookup and attach.
    pub async fn join(
        self: &Arc<Self>,
        document_id: &str,
        user_id: &str,
    ) -> Result<Attached, ConnectError> {
        for _ in 0..2 {
            let hub = self.get_or_create(document_id).await?;
            let (frames_tx, frames_rx) = mpsc::channel(self.config.outbound_capacity);
            let participant = Participant::new(user_id, frames_tx);
            let participant_id = participant.id;
            if hub.attach(participant).await.is_ok() {
                return Ok(Attached {
                    participant_id,
                    frames: frames_rx,
                    hub,
                });
            }
            self.remove_stale(document_id).await;
        }
        error!(document_id, "could not attach to a live session controller");
        Err(ConnectError::Internal)
    }

    async fn get_or_create(self: &Arc<Self>, document_id: &str) -> Result<HubHandle, ConnectError> {
        let mut hubs = self.hubs.lock().await;
        if let Some(handle) = hubs.get(document_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let state = self.hydrate(document_id).await?;
        let version = state.version;
        let handle = Hub::spawn(
            document_id.to_string(),
            state,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            Arc::downgrade(self),
            self.config.clone(),
        );
        hubs.insert(document_id.to_string(), handle.clone());
        info!(document_id, version, "session controller created");
        Ok(handle)
    }

    /// Cache first; on miss, fetch from the store and prime the cache.
    async fn hydrate(&self, document_id: &str) -> Result<SessionState, ConnectError> {
        match timeout(
            self.config.external_timeout,
            self.cache.get_state(document_id),
        )
        .await
        {
            Ok(Ok(Some(state))) => {
                debug!(document_id, "rebuilding session from cached state");
                return Ok(state);
            }
            Ok(Ok(None)) => debug!(document_id, "cache miss, loading from store"),
            Ok(Err(err)) => {
                error!(document_id, %err, "cache read failed during hydration");
                return Err(ConnectError::Internal);
            }
            Err(_) => {
                error!(document_id, "cache read timed out during hydration");
                return Err(ConnectError::Internal);
            }
        }

        let doc = timeout(
            self.config.external_timeout,
            self.store.get_document(document_id),
        )
        .await
        .map_err(|_| {
            error!(document_id, "store load timed out during hydration");
            ConnectError::Internal
        })?
        .map_err(|err| match err {
            StoreError::NotFound => ConnectError::NotFound,
            other => {
                error!(document_id, %other, "store load failed during hydration");
                ConnectError::Internal
            }
        })?;

        match timeout(
            self.config.external_timeout,
            self.cache.set_state(document_id, &doc.content, doc.version),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(document_id, %err, "failed to prime cache"),
            Err(_) => warn!(document_id, "cache prime timed out"),
        }

        Ok(SessionState {
            content: doc.content,
            version: doc.version,
        })
    }

    /// Called by a draining controller. Removes the entry only when it
    /// still maps to that controller, so a successor registered under
    /// the same document id is left alone. Idempotent.
    pub(crate) async fn remove_hub(&self, document_id: &str, handle: &HubHandle) {
        let mut hubs = self.hubs.lock().await;
        if let Some(existing) = hubs.get(document_id) {
            if existing.same_channel(handle) {
                hubs.remove(document_id);
            }
        }
    }

    async fn remove_stale(&self, document_id: &str) {
        let mut hubs = self.hubs.lock().await;
        if let Some(existing) = hubs.get(document_id) {
            if existing.is_closed() {
                hubs.remove(document_id);
            }
        }
    }

    /// Documents with a live controller right now.
    pub async fn active_documents(&self) -> Vec<String> {
        let hubs = self.hubs.lock().await;
        hubs.iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
