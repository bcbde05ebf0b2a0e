//! Transport channels between the dev server and live clients.
//!
//! The core only talks to [`TransportChannel`]; it never assumes whether the
//! other side lives in the same process or behind a socket. Two bindings
//! ship here:
//!
//! - [`InProcessChannel`]: a connected pair of endpoints that deliver by
//!   direct call (server and runner in one process).
//! - [`StreamChannel`]: length-prefixed JSON frames over any
//!   `AsyncRead + AsyncWrite` (pipes, unix sockets, TCP, tokio duplex).
//!
//! The CLI adds a WebSocket binding on top of the same trait.
//!
//! Sends are best-effort: once a channel is closed further sends are
//! dropped silently, and transport errors are logged, never propagated.

mod broadcast;
mod in_process;
mod stream;

pub use broadcast::{ClientId, ClientMessage, HotBroadcaster};
pub use in_process::InProcessChannel;
pub use stream::StreamChannel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hotwire_proto::HotPayload;
use parking_lot::RwLock;

/// Callback invoked for every payload received on a channel.
///
/// Called on the delivering task (or, for in-process channels, inside the
/// sender's `send` call), so it must not block.
pub type MessageListener = Arc<dyn Fn(&HotPayload) + Send + Sync>;

/// Handle returned by [`TransportChannel::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A bidirectional message channel.
pub trait TransportChannel: Send + Sync {
    /// Send a payload to the other side. Dropped silently if closed.
    fn send(&self, payload: HotPayload);

    /// Register a listener for incoming payloads.
    fn on_message(&self, listener: MessageListener) -> ListenerId;

    fn off_message(&self, id: ListenerId);

    /// Start delivering incoming payloads. Payloads that arrived earlier are
    /// delivered now, in order.
    fn listen(&self);

    /// Close both directions. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Listener registry for [`TransportChannel`] implementations.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, MessageListener)>>,
}

impl Listeners {
    pub fn add(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.entries.write().retain(|(entry, _)| *entry != id);
    }

    /// Call every listener. The registry lock is not held while calling, so
    /// listeners may (un)register listeners themselves.
    pub fn dispatch(&self, payload: &HotPayload) {
        let snapshot: Vec<MessageListener> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(payload);
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
