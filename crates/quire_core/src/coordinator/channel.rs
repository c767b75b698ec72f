//! Named worker channels.
//!
//! Sessions address the save worker by channel name and never wait for it:
//! [`WorkerSender::send`] is fire-and-forget. A worker that has gone away only
//! produces a warning in the log.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::message::WorkerMessage;

/// Receiving half of a worker channel.
pub type WorkerReceiver = mpsc::UnboundedReceiver<WorkerMessage>;

/// Sending half of a worker channel.
#[derive(Debug, Clone)]
pub struct WorkerSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerSender {
    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message for the worker. Never blocks and never fails; if the
    /// worker is gone the message is dropped with a warning.
    pub fn send(&self, message: WorkerMessage) {
        if let Err(err) = self.tx.send(message) {
            log::warn!(
                "Worker channel '{}' is closed, dropping message for connection {}",
                self.name,
                err.0.connection_id()
            );
        }
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a standalone worker channel.
pub fn worker_channel(name: &str) -> (WorkerSender, WorkerReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WorkerSender {
            name: Arc::from(name),
            tx,
        },
        rx,
    )
}

/// Registry of worker channels by name.
#[derive(Debug, Default)]
pub struct ChannelLayer {
    channels: RwLock<HashMap<String, WorkerSender>>,
}

impl ChannelLayer {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under `name` and return its receiving half.
    ///
    /// Registering an existing name replaces the previous channel.
    pub fn register(&self, name: &str) -> WorkerReceiver {
        let (sender, receiver) = worker_channel(name);
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.insert(name.to_string(), sender).is_some() {
            log::debug!("Replaced worker channel '{}'", name);
        }
        receiver
    }

    /// Sending half of a registered channel.
    pub fn sender(&self, name: &str) -> Option<WorkerSender> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(name).cloned()
    }

    /// Send to a channel by name, fire-and-forget.
    pub fn send(&self, name: &str, message: WorkerMessage) {
        match self.sender(name) {
            Some(sender) => sender.send(message),
            None => log::warn!(
                "No worker channel '{}', dropping message for connection {}",
                name,
                message.connection_id()
            ),
        }
    }

    /// Remove a channel; its receiver sees the end of the stream once every
    /// outstanding sender is dropped.
    pub fn unregister(&self, name: &str) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush(id: &str) -> WorkerMessage {
        WorkerMessage::Flush {
            connection_id: id.to_string(),
        }
    }

    #[test]
    fn test_send_by_name() {
        let layer = ChannelLayer::new();
        let mut rx = layer.register("doc-save");

        layer.send("doc-save", flush("a"));
        layer.sender("doc-save").unwrap().send(flush("b"));

        assert_eq!(rx.try_recv().unwrap(), flush("a"));
        assert_eq!(rx.try_recv().unwrap(), flush("b"));
    }

    #[test]
    fn test_send_to_unknown_channel_is_dropped() {
        let layer = ChannelLayer::new();
        layer.send("nowhere", flush("a"));
        assert!(layer.sender("nowhere").is_none());
    }

    #[test]
    fn test_send_after_worker_gone_does_not_panic() {
        let (sender, rx) = worker_channel("doc-save");
        drop(rx);
        assert!(sender.is_closed());
        sender.send(flush("a"));
    }

    #[test]
    fn test_unregister_closes_stream() {
        let layer = ChannelLayer::new();
        let mut rx = layer.register("doc-save");
        layer.unregister("doc-save");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
