//! The write coordinator: per-connection buffering, debouncing and flushing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::channel::WorkerReceiver;
use super::message::{FlushEvent, WorkerMessage};
use super::timer::DebounceTimer;
use crate::config::CoordinatorConfig;
use crate::crdt::{DocTarget, DocumentStore, StorageResult, engine};
use crate::error::QuireError;

/// A buffer belongs to one connection and one document. A buffer for a
/// document the connection has left may outlive the switch if its flush
/// failed, and must never receive updates for the new document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BufferKey {
    connection_id: String,
    document: DocTarget,
}

impl BufferKey {
    fn new(connection_id: &str, document: &DocTarget) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            document: document.clone(),
        }
    }
}

/// Updates buffered for one connection, waiting to be flushed.
#[derive(Debug)]
struct PendingWrite {
    author: Option<String>,
    updates: Vec<Vec<u8>>,
    first_buffered_at: Instant,
    /// Bumped whenever the timer is re-armed, so stale firings can be told apart
    generation: u64,
    timer: DebounceTimer,
}

impl PendingWrite {
    fn new(author: Option<String>) -> Self {
        Self {
            author,
            updates: Vec::new(),
            first_buffered_at: Instant::now(),
            generation: 0,
            timer: DebounceTimer::new(),
        }
    }
}

/// Posted by a buffer's timer back into the coordinator loop.
#[derive(Debug)]
struct DebounceElapsed {
    key: BufferKey,
    generation: u64,
}

/// Coalesces the update stream of every live connection into few, serialized
/// writes.
///
/// Each connection gets its own buffer. A buffer is flushed once its
/// connection has been idle for the debounce window, when the connection
/// asks for it (disconnect), or when an optional size/age bound is hit. A
/// flush merges the whole buffer into the stored document and appends exactly
/// one history entry.
///
/// The coordinator is single-owner: all state changes happen inside
/// [`run`](Self::run) (or the `&mut self` methods), and timers only post
/// messages back into that loop.
pub struct WriteCoordinator {
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
    pending: HashMap<BufferKey, PendingWrite>,
    elapsed_tx: mpsc::UnboundedSender<DebounceElapsed>,
    elapsed_rx: mpsc::UnboundedReceiver<DebounceElapsed>,
    events: Option<mpsc::UnboundedSender<FlushEvent>>,
}

impl WriteCoordinator {
    /// Create a coordinator writing to `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: CoordinatorConfig) -> Self {
        let (elapsed_tx, elapsed_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            pending: HashMap::new(),
            elapsed_tx,
            elapsed_rx,
            events: None,
        }
    }

    /// Receive [`FlushEvent`]s for every flush outcome from now on.
    ///
    /// Only one subscriber is kept; subscribing again replaces it.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<FlushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Configuration in use
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of connections with buffered updates.
    pub fn pending_connections(&self) -> usize {
        self.pending
            .keys()
            .map(|key| key.connection_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of updates buffered for a connection, across documents.
    pub fn buffered_updates(&self, connection_id: &str) -> usize {
        self.pending
            .iter()
            .filter(|(key, _)| key.connection_id == connection_id)
            .map(|(_, pending)| pending.updates.len())
            .sum()
    }

    /// Number of updates buffered for a connection on one document.
    pub fn buffered_updates_for(&self, connection_id: &str, document: &DocTarget) -> usize {
        self.pending
            .get(&BufferKey::new(connection_id, document))
            .map(|p| p.updates.len())
            .unwrap_or(0)
    }

    /// Consume worker messages until the channel closes, then flush every
    /// remaining buffer.
    pub async fn run(mut self, mut receiver: WorkerReceiver) {
        log::info!(
            "Write coordinator started on '{}' (debounce {:?})",
            self.config.worker_channel,
            self.config.debounce()
        );

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some(elapsed) = self.elapsed_rx.recv() => self.on_debounce_elapsed(elapsed).await,
            }
        }

        self.flush_all().await;
        log::info!("Write coordinator on '{}' stopped", self.config.worker_channel);
    }

    /// Dispatch a single worker message.
    pub async fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Updated {
                connection_id,
                document,
                author,
                update,
            } => {
                self.notify_update(&connection_id, document, author, update)
                    .await
            }
            WorkerMessage::Flush { connection_id } => {
                if let Err(e) = self.force_flush(&connection_id).await {
                    log::error!("Flush for connection {} failed: {}", connection_id, e);
                }
            }
        }
    }

    /// Buffer an update for a connection and restart its debounce timer.
    pub async fn notify_update(
        &mut self,
        connection_id: &str,
        document: DocTarget,
        author: Option<String>,
        update: Vec<u8>,
    ) {
        // A connection edits one document; buffers it left behind on another
        // document are written out first. One that fails stays requeued under
        // its own key.
        for stale in self.keys_for(connection_id) {
            if stale.document == document {
                continue;
            }
            if let Err(e) = self.flush(&stale).await {
                log::error!(
                    "Flush of {} before document switch failed for {}: {}",
                    stale.document,
                    connection_id,
                    e
                );
            }
        }

        let key = BufferKey::new(connection_id, &document);
        let pending = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingWrite::new(author.clone()));
        if author.is_some() {
            pending.author = author;
        }
        pending.updates.push(update);

        log::debug!(
            "Buffered update {} for connection {} on {}",
            pending.updates.len(),
            connection_id,
            document
        );

        let over_count = self
            .config
            .max_buffered_updates
            .is_some_and(|max| pending.updates.len() >= max);
        let over_age = self
            .config
            .max_buffered_age()
            .is_some_and(|max| pending.first_buffered_at.elapsed() >= max);

        if over_count || over_age {
            log::debug!(
                "Buffer bound reached for connection {}, flushing now",
                connection_id
            );
            if let Err(e) = self.flush(&key).await {
                log::error!("Flush for connection {} failed: {}", connection_id, e);
            }
        } else {
            self.arm_timer(&key);
        }
    }

    /// Cancel the connection's timers and flush its buffers now.
    ///
    /// Returns the id of the newest history entry written, or `None` when
    /// there was nothing to write. Every buffer is attempted; the first
    /// failure is returned.
    pub async fn force_flush(&mut self, connection_id: &str) -> StorageResult<Option<i64>> {
        let mut latest = None;
        let mut failure = None;

        for key in self.keys_for(connection_id) {
            match self.flush(&key).await {
                Ok(entry_id) => latest = latest.max(entry_id),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => log::error!(
                    "Flush of {} for connection {} failed: {}",
                    key.document,
                    connection_id,
                    e
                ),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(latest),
        }
    }

    /// Buffer keys of one connection, in a stable order.
    fn keys_for(&self, connection_id: &str) -> Vec<BufferKey> {
        let mut keys: Vec<BufferKey> = self
            .pending
            .keys()
            .filter(|key| key.connection_id == connection_id)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn on_debounce_elapsed(&mut self, elapsed: DebounceElapsed) {
        let current = self.pending.get(&elapsed.key).map(|p| p.generation);
        if current != Some(elapsed.generation) {
            // Re-armed or already flushed since this timer was set
            return;
        }
        if let Err(e) = self.flush(&elapsed.key).await {
            log::error!(
                "Debounced flush for connection {} failed: {}",
                elapsed.key.connection_id,
                e
            );
        }
    }

    async fn flush_all(&mut self) {
        let mut keys: Vec<BufferKey> = self.pending.keys().cloned().collect();
        keys.sort();
        for key in keys {
            if let Err(e) = self.flush(&key).await {
                log::error!(
                    "Final flush for connection {} failed, {} updates to {} not persisted: {}",
                    key.connection_id,
                    self.buffered_updates_for(&key.connection_id, &key.document),
                    key.document,
                    e
                );
            }
        }
    }

    fn arm_timer(&mut self, key: &BufferKey) {
        let Some(pending) = self.pending.get_mut(key) else {
            return;
        };
        pending.generation += 1;

        let tx = self.elapsed_tx.clone();
        let elapsed = DebounceElapsed {
            key: key.clone(),
            generation: pending.generation,
        };
        pending.timer.trigger(self.config.debounce(), move || {
            // The coordinator may have shut down in the meantime
            let _ = tx.send(elapsed);
        });
    }

    async fn flush(&mut self, key: &BufferKey) -> StorageResult<Option<i64>> {
        let Some(mut pending) = self.pending.remove(key) else {
            return Ok(None);
        };
        pending.timer.cancel();

        if pending.updates.is_empty() {
            return Ok(None);
        }

        let connection_id = key.connection_id.as_str();
        let updates = Arc::new(std::mem::take(&mut pending.updates));
        let count = updates.len();

        let result = self.persist(key, &pending, updates.clone()).await;
        match result {
            Ok((entry_id, attempts)) => {
                log::info!(
                    "Persisted {} updates from connection {} to {} as history entry {}",
                    count,
                    connection_id,
                    key.document,
                    entry_id
                );
                self.emit(FlushEvent::Persisted {
                    connection_id: connection_id.to_string(),
                    document: key.document.clone(),
                    entry_id,
                    updates: count,
                    attempts,
                });
                Ok(Some(entry_id))
            }
            Err((err, _)) if is_permanent(&err) => {
                log::error!(
                    "Discarding {} updates from connection {} to {}: {}",
                    count,
                    connection_id,
                    key.document,
                    err
                );
                self.emit(FlushEvent::Discarded {
                    connection_id: connection_id.to_string(),
                    document: key.document.clone(),
                    updates: count,
                    error: err.to_string(),
                });
                Err(err)
            }
            Err((err, attempts)) => {
                log::error!(
                    "Flush of connection {} to {} failed after {} attempts, requeueing {} updates: {}",
                    connection_id,
                    key.document,
                    attempts,
                    count,
                    err
                );
                self.emit(FlushEvent::Failed {
                    connection_id: connection_id.to_string(),
                    document: key.document.clone(),
                    attempts,
                    error: err.to_string(),
                });

                pending.updates = Arc::try_unwrap(updates).unwrap_or_else(|shared| (*shared).clone());
                self.requeue(key, pending);
                Err(err)
            }
        }
    }

    /// Put a failed buffer back in front of anything buffered since.
    fn requeue(&mut self, key: &BufferKey, mut pending: PendingWrite) {
        if let Some(newer) = self.pending.remove(key) {
            pending.updates.extend(newer.updates);
        }
        self.pending.insert(key.clone(), pending);
        self.arm_timer(key);
    }

    /// Run the merge inside the store's exclusive section, retrying transient
    /// failures. Returns the entry id and the number of attempts made.
    async fn persist(
        &self,
        key: &BufferKey,
        pending: &PendingWrite,
        updates: Arc<Vec<Vec<u8>>>,
    ) -> Result<(i64, u32), (QuireError, u32)> {
        let max_attempts = self.config.max_flush_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let store = self.store.clone();
            let target = key.document.clone();
            let author = pending.author.clone();
            let updates = updates.clone();
            let copy = self.config.copy_fields.clone();
            let result = tokio::task::spawn_blocking(move || {
                store.commit_locked(&target, author.as_deref(), &mut |base| {
                    engine::merge_copying_fields(base, updates.as_slice(), &copy)
                })
            })
            .await
            .unwrap_or_else(|e| {
                Err(QuireError::StorageUnavailable(format!(
                    "flush task failed: {}",
                    e
                )))
            });

            match result {
                Ok(entry_id) => return Ok((entry_id, attempt)),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    log::warn!(
                        "Flush attempt {} of {} for connection {} failed, retrying: {}",
                        attempt,
                        max_attempts,
                        key.connection_id,
                        err
                    );
                    self.emit(FlushEvent::Retrying {
                        connection_id: key.connection_id.clone(),
                        document: key.document.clone(),
                        attempt,
                        error: err.to_string(),
                    });
                    tokio::time::sleep(self.config.retry_delay(attempt)).await;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }

    fn emit(&self, event: FlushEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Failures no amount of retrying will fix.
fn is_permanent(err: &QuireError) -> bool {
    matches!(
        err,
        QuireError::DocumentNotFound(_) | QuireError::Crdt(_)
    )
}
