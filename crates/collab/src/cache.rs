//! Fast shared cache for live session state and the per-document undo log.
//!
//! The controller's single-threaded execution already serializes access
//! per document, so every primitive is a single round trip and no
//! multi-key transactionality is needed.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Mirrored working copy of a live document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub content: String,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Keyed session-state and undo-log primitives.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Returns the cached state for a document, `None` on miss.
    async fn get_state(&self, document_id: &str) -> Result<Option<SessionState>, CacheError>;

    /// Atomically overwrites the cached state for a document.
    async fn set_state(
        &self,
        document_id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), CacheError>;

    async fn clear_state(&self, document_id: &str) -> Result<(), CacheError>;

    /// Prepends an encoded operation to the document's undo log.
    async fn push_op(&self, document_id: &str, op: &[u8]) -> Result<(), CacheError>;

    /// Atomically removes and returns the newest undo-log entry.
    async fn pop_op(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError>;
}

fn session_key(document_id: &str) -> String {
    format!("doc_session:{document_id}")
}

fn ops_key(document_id: &str) -> String {
    format!("doc_ops:{document_id}")
}

/// In-process cache. A deployment fronting several services would back
/// this trait with a networked store under the same keyspace.
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: DashMap<String, SessionState>,
    ops: DashMap<String, Vec<Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn get_state(&self, document_id: &str) -> Result<Option<SessionState>, CacheError> {
        Ok(self
            .state
            .get(&session_key(document_id))
            .map(|entry| entry.clone()))
    }

    async fn set_state(
        &self,
        document_id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), CacheError> {
        self.state.insert(
            session_key(document_id),
            SessionState {
                content: content.to_string(),
                version,
            },
        );
        Ok(())
    }

    async fn clear_state(&self, document_id: &str) -> Result<(), CacheError> {
        self.state.remove(&session_key(document_id));
        Ok(())
    }

    async fn push_op(&self, document_id: &str, op: &[u8]) -> Result<(), CacheError> {
        self.ops
            .entry(ops_key(document_id))
            .or_default()
            .insert(0, op.to_vec());
        Ok(())
    }

    async fn pop_op(&self, document_id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.ops.get_mut(&ops_key(document_id)).and_then(|mut list| {
            if list.is_empty() {
                None
            } else {
                Some(list.remove(0))
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_round_trip_and_clear() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get_state("d1").await.unwrap(), None);

        cache.set_state("d1", "Hi", 3).await.unwrap();
        assert_eq!(
            cache.get_state("d1").await.unwrap(),
            Some(SessionState {
                content: "Hi".to_string(),
                version: 3
            })
        );

        cache.set_state("d1", "Hi!", 4).await.unwrap();
        assert_eq!(cache.get_state("d1").await.unwrap().unwrap().version, 4);

        cache.clear_state("d1").await.unwrap();
        assert_eq!(cache.get_state("d1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn documents_do_not_share_state() {
        let cache = MemoryCache::new();
        cache.set_state("d1", "one", 1).await.unwrap();
        assert_eq!(cache.get_state("d2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn undo_log_pops_newest_first() {
        let cache = MemoryCache::new();
        assert_eq!(cache.pop_op("d1").await.unwrap(), None);

        cache.push_op("d1", b"first").await.unwrap();
        cache.push_op("d1", b"second").await.unwrap();

        assert_eq!(cache.pop_op("d1").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(cache.pop_op("d1").await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(cache.pop_op("d1").await.unwrap(), None);
    }
}
