use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use quire_core::crdt::{DocTarget, DocumentStore, engine};
use quire_core::{QuireError, Result};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};
use yrs::Doc;

/// An update relayed between the connections of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUpdate {
    /// Connection the update came from
    pub origin: String,
    /// Encoded update
    pub update: Vec<u8>,
}

/// Global registry of rooms, one per open document
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocTarget, Arc<DocRoom>>>,
}

impl RoomRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room for a document.
    ///
    /// A new room starts from the stored state. Fails with
    /// [`QuireError::DocumentNotFound`] for unknown documents.
    pub async fn get_or_create_room(
        &self,
        target: &DocTarget,
        store: &dyn DocumentStore,
    ) -> Result<Arc<DocRoom>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(target) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(target) {
            return Ok(room.clone());
        }

        let state = store
            .load_doc(target)?
            .ok_or_else(|| QuireError::DocumentNotFound(target.clone()))?;
        let room = Arc::new(DocRoom::new(target.clone(), &state)?);
        rooms.insert(target.clone(), room.clone());
        info!("Created room for {}", target);

        Ok(room)
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, target: &DocTarget) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(target)
            .is_some_and(|room| room.connection_count() == 0)
        {
            rooms.remove(target);
            info!("Removed idle room for {}", target);
        }
    }

    /// Number of open rooms
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Live state shared by all connections editing one document.
///
/// The room keeps a replica with every relayed update applied, so a joining
/// connection sees edits that have not been flushed yet.
pub struct DocRoom {
    target: DocTarget,
    replica: Mutex<Doc>,
    broadcast_tx: broadcast::Sender<RoomUpdate>,
    connection_count: AtomicUsize,
}

impl DocRoom {
    /// Create a room starting from `state`
    pub fn new(target: DocTarget, state: &[u8]) -> Result<Self> {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Ok(Self {
            target,
            replica: Mutex::new(engine::doc_from_state(state)?),
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
        })
    }

    /// Document of this room
    pub fn target(&self) -> &DocTarget {
        &self.target
    }

    /// Join the room: subscribe to relayed updates and get the current state.
    ///
    /// Subscribing happens first, so no update falls between the two; an
    /// update already contained in the state may arrive again, which is
    /// harmless.
    pub fn join(&self) -> (broadcast::Receiver<RoomUpdate>, Vec<u8>) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        let rx = self.broadcast_tx.subscribe();
        (rx, self.state())
    }

    /// Leave the room
    pub fn leave(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of connections in the room
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Current live state
    pub fn state(&self) -> Vec<u8> {
        let replica = self.replica.lock().unwrap_or_else(PoisonError::into_inner);
        engine::encode_state(&replica)
    }

    /// Apply an update from `origin` and relay it to the other connections.
    pub fn publish(&self, origin: &str, update: Vec<u8>) -> Result<()> {
        {
            let replica = self.replica.lock().unwrap_or_else(PoisonError::into_inner);
            engine::apply_update(&replica, &update)?;
        }
        let receivers = self
            .broadcast_tx
            .send(RoomUpdate {
                origin: origin.to_string(),
                update,
            })
            .unwrap_or(0);
        debug!("Relayed update from {} to {} receivers", origin, receivers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::crdt::MemoryStorage;
    use yrs::{GetString, Text, Transact};

    fn typed(text: &str) -> Vec<u8> {
        let doc = engine::new_doc();
        let body = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        body.insert(&mut txn, 0, text);
        txn.encode_update_v1()
    }

    fn body(state: &[u8]) -> String {
        let doc = engine::doc_from_state(state).unwrap();
        let body = doc.get_or_insert_text("body");
        let txn = doc.transact();
        body.get_string(&txn)
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let store = MemoryStorage::new();
        let target = store.create_doc("doc").unwrap();
        let registry = RoomRegistry::new();

        let room = registry.get_or_create_room(&target, &store).await.unwrap();
        let again = registry.get_or_create_room(&target, &store).await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));

        let (_rx, _) = room.join();
        registry.maybe_remove_room(&target).await;
        assert_eq!(registry.room_count().await, 1);

        room.leave();
        registry.maybe_remove_room(&target).await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let store = MemoryStorage::new();
        let registry = RoomRegistry::new();
        let result = registry
            .get_or_create_room(&DocTarget::new("doc", 7), &store)
            .await;
        assert!(matches!(result, Err(QuireError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_relays_and_updates_state() {
        let room = DocRoom::new(DocTarget::new("doc", 1), &engine::empty_state()).unwrap();
        let (mut rx, _) = room.join();

        room.publish("conn-a", typed("hi")).unwrap();

        let relayed = rx.recv().await.unwrap();
        assert_eq!(relayed.origin, "conn-a");
        let (_late_rx, state) = room.join();
        assert_eq!(body(&state), "hi");
        assert_eq!(room.connection_count(), 2);
    }
}
