//! Durable-state worker channel.
//!
//! Books and nonces are flushed to a background worker over a typed channel.
//! Saves are fire-and-forget; the engine never blocks on a durable commit.
//! Loads are request/response, correlated by a oneshot reply channel.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::services::matching::BookSnapshot;
use crate::services::nonce::NonceSnapshot;

/// Messages understood by the persistence worker.
#[derive(Debug)]
pub enum PersistRequest {
    SaveBook {
        market_id: u128,
        snapshot: BookSnapshot,
    },
    SaveNonces {
        nonces: NonceSnapshot,
    },
    LoadBook {
        market_id: u128,
        reply: oneshot::Sender<Option<BookSnapshot>>,
    },
    LoadNonces {
        reply: oneshot::Sender<NonceSnapshot>,
    },
}

/// Cheap cloneable handle to the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl PersistenceHandle {
    pub fn new(tx: mpsc::UnboundedSender<PersistRequest>) -> Self {
        Self { tx }
    }

    pub fn save_book(&self, market_id: u128, snapshot: BookSnapshot) {
        if self
            .tx
            .send(PersistRequest::SaveBook {
                market_id,
                snapshot,
            })
            .is_err()
        {
            error!(market_id, "persistence worker is gone, book save dropped");
        }
    }

    pub fn save_nonces(&self, nonces: NonceSnapshot) {
        if self.tx.send(PersistRequest::SaveNonces { nonces }).is_err() {
            error!("persistence worker is gone, nonce save dropped");
        }
    }

    pub async fn load_book(&self, market_id: u128) -> Option<BookSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PersistRequest::LoadBook { market_id, reply })
            .is_err()
        {
            error!(market_id, "persistence worker is gone, book load skipped");
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn load_nonces(&self) -> NonceSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PersistRequest::LoadNonces { reply }).is_err() {
            error!("persistence worker is gone, nonce load skipped");
            return NonceSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// In-process store that round-trips snapshots through their serialized
/// form, the way a durable backend would.
#[derive(Default)]
pub struct MemoryStore {
    books: HashMap<u128, String>,
    nonces: Option<String>,
}

impl MemoryStore {
    fn handle(&mut self, request: PersistRequest) {
        match request {
            PersistRequest::SaveBook {
                market_id,
                snapshot,
            } => match serde_json::to_string(&snapshot) {
                Ok(encoded) => {
                    debug!(market_id, bytes = encoded.len(), "book snapshot saved");
                    self.books.insert(market_id, encoded);
                }
                Err(e) => error!(market_id, error = %e, "failed to encode book snapshot"),
            },
            PersistRequest::SaveNonces { nonces } => match serde_json::to_string(&nonces) {
                Ok(encoded) => {
                    self.nonces = Some(encoded);
                }
                Err(e) => error!(error = %e, "failed to encode nonce snapshot"),
            },
            PersistRequest::LoadBook { market_id, reply } => {
                let snapshot = self.books.get(&market_id).and_then(|encoded| {
                    serde_json::from_str(encoded)
                        .map_err(|e| {
                            warn!(market_id, error = %e, "stored book snapshot is unreadable")
                        })
                        .ok()
                });
                let _ = reply.send(snapshot);
            }
            PersistRequest::LoadNonces { reply } => {
                let snapshot = self
                    .nonces
                    .as_ref()
                    .and_then(|encoded| {
                        serde_json::from_str(encoded)
                            .map_err(|e| warn!(error = %e, "stored nonces are unreadable"))
                            .ok()
                    })
                    .unwrap_or_default();
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// Spawn the in-memory worker and return a handle to it.
pub fn spawn_memory_store() -> PersistenceHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut store = MemoryStore::default();
        while let Some(request) = rx.recv().await {
            store.handle(request);
        }
        debug!("persistence worker stopped");
    });
    PersistenceHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    #[tokio::test]
    async fn book_snapshot_round_trips() {
        let handle = spawn_memory_store();
        let snapshot = BookSnapshot {
            market_id: 7,
            orders: vec![crate::testkit::limit_order(1, 10, U256::from(100))],
            stops: vec![],
        };

        handle.save_book(7, snapshot.clone());
        let loaded = handle.load_book(7).await.unwrap();
        assert_eq!(loaded.market_id, 7);
        assert_eq!(loaded.orders.len(), 1);
        assert_eq!(loaded.orders[0].id, snapshot.orders[0].id);
    }

    #[tokio::test]
    async fn missing_book_loads_as_none() {
        let handle = spawn_memory_store();
        assert!(handle.load_book(99).await.is_none());
    }

    #[tokio::test]
    async fn nonces_round_trip() {
        let handle = spawn_memory_store();
        let registry = crate::services::nonce::NonceRegistry::new();
        registry.increment(42);
        registry.increment(42);

        handle.save_nonces(registry.snapshot());
        let loaded = handle.load_nonces().await;

        let restored = crate::services::nonce::NonceRegistry::new();
        restored.restore(loaded);
        assert_eq!(restored.current(42), U256::from(2));
    }
}
