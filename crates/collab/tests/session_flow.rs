//! End-to-end session tests: participants join through the registry and
//! exchange frames with the document's controller over their outbound
//! queues, exactly as the socket pumps would.

use std::sync::Arc;
use std::time::Duration;

use collab::cache::{MemoryCache, SessionCache};
use collab::operation::Operation;
use collab::protocol::ServerFrame;
use collab::registry::{Attached, Registry};
use collab::store::{MemoryStore, Store};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::Receiver;

struct Harness {
    registry: Arc<Registry>,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    document_id: String,
    user_id: String,
}

async fn harness(content: &str, version: u64) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());

    let owner = store.create_user("owner@example.com", "pw").await.unwrap();
    let doc = store.create_document("Doc", &owner.id).await.unwrap();
    store.save_document(&doc.id, content, version).await.unwrap();

    let registry = Registry::new(
        store.clone() as Arc<dyn Store>,
        cache.clone() as Arc<dyn SessionCache>,
    );

    Harness {
        registry,
        store,
        cache,
        document_id: doc.id,
        user_id: owner.id,
    }
}

impl Harness {
    async fn join(&self) -> Attached {
        self.registry
            .join(&self.document_id, &self.user_id)
            .await
            .unwrap()
    }
}

async fn recv(frames: &mut Receiver<ServerFrame>) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound queue closed")
}

fn insert(pos: usize, text: &str, version: u64) -> Operation {
    Operation::Insert {
        pos,
        text: text.to_string(),
        version,
    }
}

fn delete(pos: usize, len: usize, version: u64) -> Operation {
    Operation::Delete {
        pos,
        len,
        text: String::new(),
        version,
    }
}

#[tokio::test]
async fn test_two_clients_one_edit() {
    let h = harness("Hi", 0).await;

    let mut a = h.join().await;
    assert_eq!(
        recv(&mut a.frames).await,
        ServerFrame::InitialState {
            content: "Hi".to_string(),
            version: 0
        }
    );

    let mut b = h.join().await;
    assert_eq!(
        recv(&mut b.frames).await,
        ServerFrame::InitialState {
            content: "Hi".to_string(),
            version: 0
        }
    );

    a.hub.submit(a.participant_id, insert(2, "!", 0)).await.unwrap();

    // The other participant receives the stamped canonical operation.
    assert_eq!(
        recv(&mut b.frames).await,
        ServerFrame::Operation {
            op: insert(2, "!", 1)
        }
    );
    // The submitter's own optimistic apply is authoritative: no echo.
    assert!(matches!(a.frames.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_stale_version_resyncs_submitter_only() {
    let h = harness("Hi", 0).await;
    let mut a = h.join().await;
    let mut b = h.join().await;
    recv(&mut a.frames).await;
    recv(&mut b.frames).await;

    a.hub.submit(a.participant_id, insert(2, "!", 0)).await.unwrap();
    recv(&mut b.frames).await;

    // A is still at version 0; its edit must not apply.
    a.hub.submit(a.participant_id, insert(0, "X", 0)).await.unwrap();
    assert_eq!(
        recv(&mut a.frames).await,
        ServerFrame::OutOfSync {
            content: "Hi!".to_string(),
            version: 1
        }
    );
    assert!(matches!(b.frames.try_recv(), Err(TryRecvError::Empty)));

    // Server state is unchanged: an edit at version 1 still applies.
    a.hub.submit(a.participant_id, insert(3, "?", 1)).await.unwrap();
    assert_eq!(
        recv(&mut b.frames).await,
        ServerFrame::Operation {
            op: insert(3, "?", 2)
        }
    );
}

#[tokio::test]
async fn test_delete_then_undo_reaches_everyone() {
    let h = harness("abc", 0).await;
    let mut a = h.join().await;
    let mut b = h.join().await;
    recv(&mut a.frames).await;
    recv(&mut b.frames).await;

    a.hub.submit(a.participant_id, delete(1, 1, 0)).await.unwrap();
    assert_eq!(
        recv(&mut b.frames).await,
        ServerFrame::Operation {
            op: Operation::Delete {
                pos: 1,
                len: 1,
                text: "b".to_string(),
                version: 1
            }
        }
    );

    a.hub
        .submit(a.participant_id, Operation::Undo { version: 0 })
        .await
        .unwrap();

    // Undos are not local echoes: submitter and peers both apply the
    // compensating insert.
    let expected = ServerFrame::Operation {
        op: insert(1, "b", 2),
    };
    assert_eq!(recv(&mut a.frames).await, expected);
    assert_eq!(recv(&mut b.frames).await, expected);
}

#[tokio::test]
async fn test_invalid_position_is_rejected() {
    let h = harness("ab", 0).await;
    let mut a = h.join().await;
    let mut b = h.join().await;
    recv(&mut a.frames).await;
    recv(&mut b.frames).await;

    a.hub.submit(a.participant_id, insert(5, "z", 0)).await.unwrap();
    match recv(&mut a.frames).await {
        ServerFrame::Error { error } => assert!(error.contains("out of range"), "{error}"),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(matches!(b.frames.try_recv(), Err(TryRecvError::Empty)));

    // State unchanged: version 0 edits still apply.
    a.hub.submit(a.participant_id, insert(2, "c", 0)).await.unwrap();
    assert_eq!(
        recv(&mut b.frames).await,
        ServerFrame::Operation {
            op: insert(2, "c", 1)
        }
    );
}

#[tokio::test]
async fn test_last_participant_flushes_and_deregisters() {
    let h = harness("x", 7).await;
    let mut a = h.join().await;
    recv(&mut a.frames).await;

    a.hub.submit(a.participant_id, insert(1, "!", 7)).await.unwrap();
    a.hub.detach(a.participant_id).await.unwrap();

    // The controller saves the final state, clears the cache, and
    // deregisters itself.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let doc = h.store.get_document(&h.document_id).await.unwrap();
        if doc.version == 8 && h.registry.active_documents().await.is_empty() {
            assert_eq!(doc.content, "x!");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "controller did not flush and deregister"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.cache.get_state(&h.document_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_slow_participant_is_evicted() {
    let h = harness("", 0).await;
    let mut a = h.join().await;
    let mut b = h.join().await;
    recv(&mut a.frames).await;
    recv(&mut b.frames).await;

    // B stops draining its queue; A keeps editing past B's capacity.
    for i in 0..300u64 {
        a.hub
            .submit(a.participant_id, insert(i as usize, "x", i))
            .await
            .unwrap();
    }

    // A's edits kept succeeding and the controller stayed live.
    let mut c = h.join().await;
    assert_eq!(
        recv(&mut c.frames).await,
        ServerFrame::InitialState {
            content: "x".repeat(300),
            version: 300
        }
    );

    a.hub.submit(a.participant_id, insert(300, "y", 300)).await.unwrap();
    assert_eq!(
        recv(&mut c.frames).await,
        ServerFrame::Operation {
            op: insert(300, "y", 301)
        }
    );

    // B got exactly its queue capacity before eviction closed its queue.
    let mut delivered = 0;
    while let Some(frame) = b.frames.recv().await {
        assert!(matches!(frame, ServerFrame::Operation { .. }));
        delivered += 1;
    }
    assert_eq!(delivered, 256);
}
