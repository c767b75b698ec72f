//! Session-facing half of write coordination.
//!
//! An [`EditSession`] holds one connection's replica of a document. Updates
//! the replica emits are queued by the observer and only forwarded to the save
//! worker after the transaction that produced them has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use yrs::{Doc, Subscription};

use super::channel::WorkerSender;
use super::message::WorkerMessage;
use crate::crdt::{DocTarget, engine};
use crate::error::{QuireError, Result};

/// One live connection editing one document.
///
/// Dropping the session asks the worker to flush whatever the connection has
/// buffered.
pub struct EditSession {
    connection_id: String,
    document: DocTarget,
    author: Option<String>,
    doc: Doc,
    outbox: Arc<Mutex<Vec<Vec<u8>>>>,
    relaying: Arc<AtomicBool>,
    worker: WorkerSender,
    _subscription: Subscription,
}

impl EditSession {
    /// Open a session on a document, starting from its stored state.
    pub fn open(
        connection_id: impl Into<String>,
        document: DocTarget,
        state: &[u8],
        author: Option<String>,
        worker: WorkerSender,
    ) -> Result<Self> {
        let doc = engine::doc_from_state(state)?;
        let outbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let relaying = Arc::new(AtomicBool::new(false));

        let subscription = {
            let outbox = outbox.clone();
            let relaying = relaying.clone();
            doc.observe_update_v1(move |_txn, event| {
                if relaying.load(Ordering::SeqCst) {
                    return;
                }
                outbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.update.clone());
            })
            .map_err(|e| QuireError::Crdt(format!("Failed to observe document updates: {}", e)))?
        };

        let connection_id = connection_id.into();
        log::debug!("Opened session {} on {}", connection_id, document);

        Ok(Self {
            connection_id,
            document,
            author,
            doc,
            outbox,
            relaying,
            worker,
            _subscription: subscription,
        })
    }

    /// Connection id
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Document being edited
    pub fn document(&self) -> &DocTarget {
        &self.document
    }

    /// The session's replica
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Full state of the replica, for syncing a newly connected client.
    pub fn encode_state(&self) -> Vec<u8> {
        engine::encode_state(&self.doc)
    }

    /// Apply an update sent by this session's client and forward the
    /// resulting update(s) to the save worker.
    ///
    /// Returns the number of updates forwarded.
    pub fn receive(&self, update: &[u8]) -> Result<usize> {
        engine::apply_update(&self.doc, update)?;
        Ok(self.forward_outbox())
    }

    /// Apply an update that originated from another connection.
    ///
    /// It is not forwarded: the originating session already reported it.
    pub fn apply_remote(&self, update: &[u8]) -> Result<()> {
        self.relaying.store(true, Ordering::SeqCst);
        let result = engine::apply_update(&self.doc, update);
        self.relaying.store(false, Ordering::SeqCst);
        result
    }

    /// Hand everything the observer queued to the worker.
    fn forward_outbox(&self) -> usize {
        let drained: Vec<Vec<u8>> = std::mem::take(
            &mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = drained.len();
        for update in drained {
            self.worker.send(WorkerMessage::Updated {
                connection_id: self.connection_id.clone(),
                document: self.document.clone(),
                author: self.author.clone(),
                update,
            });
        }
        count
    }

    /// End the session, flushing its buffered updates.
    pub fn close(self) {}
}

impl Drop for EditSession {
    fn drop(&mut self) {
        log::debug!("Closing session {} on {}", self.connection_id, self.document);
        self.worker.send(WorkerMessage::Flush {
            connection_id: self.connection_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{WorkerReceiver, worker_channel};
    use crate::test_utils::{TestClient, body_of};

    fn session(state: &[u8]) -> (EditSession, WorkerReceiver) {
        let (sender, receiver) = worker_channel("doc-save");
        let session = EditSession::open(
            "conn-1",
            DocTarget::new("doc", 1),
            state,
            Some("ada".into()),
            sender,
        )
        .unwrap();
        (session, receiver)
    }

    #[test]
    fn test_client_update_is_forwarded() {
        let base = engine::empty_state();
        let client = TestClient::from_state(&base);
        let (session, mut rx) = session(&base);

        let forwarded = session.receive(&client.append("hello")).unwrap();
        assert_eq!(forwarded, 1);

        match rx.try_recv().unwrap() {
            WorkerMessage::Updated {
                connection_id,
                document,
                author,
                update,
            } => {
                assert_eq!(connection_id, "conn-1");
                assert_eq!(document, DocTarget::new("doc", 1));
                assert_eq!(author.as_deref(), Some("ada"));
                let merged = engine::merge_into_state(&base, &[update]).unwrap();
                assert_eq!(body_of(&merged.state), "hello");
            }
            other => panic!("expected Updated, got {:?}", other),
        }
        assert_eq!(body_of(&session.encode_state()), "hello");
    }

    #[test]
    fn test_remote_update_is_not_forwarded() {
        let base = engine::empty_state();
        let peer = TestClient::from_state(&base);
        let (session, mut rx) = session(&base);

        session.apply_remote(&peer.append("from peer")).unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(body_of(&session.encode_state()), "from peer");
    }

    #[test]
    fn test_malformed_update_is_rejected() {
        let (session, mut rx) = session(&engine::empty_state());
        assert!(session.receive(&[0xff, 0xff, 0xff]).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_requests_flush() {
        let (session, mut rx) = session(&engine::empty_state());
        session.close();

        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerMessage::Flush {
                connection_id: "conn-1".into()
            }
        );
    }
}
