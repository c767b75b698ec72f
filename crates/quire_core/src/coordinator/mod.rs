//! Debounced write coordination.
//!
//! Live connections produce a stream of small updates. Writing each one would
//! mean one database write and one history entry per keystroke, so updates go
//! through two halves:
//!
//! - [`EditSession`] sits with the connection and forwards every update its
//!   replica emits as a [`WorkerMessage`] on a named worker channel.
//! - [`WriteCoordinator`] consumes that channel, buffers updates per
//!   connection, and flushes a buffer once the connection has been idle for
//!   the debounce window or disconnects.

mod channel;
mod message;
mod session;
mod timer;
mod write;

pub use channel::{ChannelLayer, WorkerReceiver, WorkerSender, worker_channel};
pub use message::{FlushEvent, WorkerMessage};
pub use session::EditSession;
pub use timer::DebounceTimer;
pub use write::WriteCoordinator;
