use crate::config::Config;
use crate::handlers::api::status_for;
use crate::sync::{DocRoom, RoomRegistry, RoomUpdate};
use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use quire_core::coordinator::{EditSession, WorkerSender};
use quire_core::crdt::{DocTarget, DocumentStore};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Author recorded on history entries written by this connection
    pub author: Option<String>,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub rooms: Arc<RoomRegistry>,
    pub worker: WorkerSender,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Path(id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let target = DocTarget::new(state.config.doc_type.as_str(), id);

    let room = match state
        .rooms
        .get_or_create_room(&target, state.store.as_ref())
        .await
    {
        Ok(room) => room,
        Err(e) => {
            warn!("WebSocket connection rejected for {}: {}", target, e);
            return status_for(&e).into_response();
        }
    };

    info!(
        "WebSocket upgrade: doc={}, author={:?}",
        target, query.author
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, room, query.author))
        .into_response()
}

/// Handle an established WebSocket connection.
///
/// Binary frames in both directions are encoded updates. The client first
/// receives the room's full state.
async fn handle_socket(
    socket: WebSocket,
    state: WsState,
    room: Arc<DocRoom>,
    author: Option<String>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut relayed, initial_state) = room.join();

    let session = match EditSession::open(
        connection_id.clone(),
        room.target().clone(),
        &initial_state,
        author,
        state.worker.clone(),
    ) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open session on {}: {}", room.target(), e);
            room.leave();
            state.rooms.maybe_remove_room(room.target()).await;
            return;
        }
    };

    info!(
        "WebSocket connected: connection={}, doc={}, connections={}",
        connection_id,
        room.target(),
        room.connection_count()
    );

    if let Err(e) = ws_tx
        .send(Message::Binary(session.encode_state().into()))
        .await
    {
        error!("Failed to send initial state: {}", e);
    } else {
        loop {
            tokio::select! {
                // Handle incoming messages from client
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match session.receive(&data) {
                                Ok(_) => {
                                    if let Err(e) = room.publish(&connection_id, data.to_vec()) {
                                        warn!("Failed to relay update from {}: {}", connection_id, e);
                                    }
                                }
                                Err(e) => warn!("Rejected update from {}: {}", connection_id, e),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client closed connection {}", connection_id);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                // Updates from the other connections of the room
                update = relayed.recv() => {
                    match update {
                        Ok(RoomUpdate { origin, update }) if origin != connection_id => {
                            if let Err(e) = session.apply_remote(&update) {
                                warn!("Failed to apply relayed update: {}", e);
                                continue;
                            }
                            if let Err(e) = ws_tx.send(Message::Binary(update.into())).await {
                                error!("Failed to send relayed update: {}", e);
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                "Connection {} missed {} relayed updates, closing",
                                connection_id, missed
                            );
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    info!(
        "WebSocket disconnected: connection={}, doc={}",
        connection_id,
        room.target()
    );

    // Closing the session asks the save worker to flush what it buffered.
    session.close();
    room.leave();
    state.rooms.maybe_remove_room(room.target()).await;
}
