//! Live document rooms shared by WebSocket connections.

mod room;

pub use room::{DocRoom, RoomRegistry, RoomUpdate};
