use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hotwire_proto::HotPayload;
use parking_lot::Mutex;
use tracing::trace;

use super::{ListenerId, Listeners, MessageListener, TransportChannel};

#[derive(Default)]
struct Gate {
    /// `listen()` was called.
    started: bool,
    /// The backlog is drained; deliveries go straight to listeners.
    open: bool,
    backlog: Vec<HotPayload>,
}

#[derive(Default)]
struct Endpoint {
    listeners: Listeners,
    gate: Mutex<Gate>,
}

impl Endpoint {
    fn deliver(&self, payload: HotPayload) {
        {
            let mut gate = self.gate.lock();
            if !gate.open {
                gate.backlog.push(payload);
                return;
            }
        }
        self.listeners.dispatch(&payload);
    }

    /// Dispatch the backlog, then open the gate. Payloads arriving while a
    /// batch is dispatched join the backlog and go out in the next round.
    fn open(&self) {
        {
            let mut gate = self.gate.lock();
            if gate.started {
                return;
            }
            gate.started = true;
        }
        loop {
            let batch = {
                let mut gate = self.gate.lock();
                if gate.backlog.is_empty() {
                    gate.open = true;
                    return;
                }
                std::mem::take(&mut gate.backlog)
            };
            for payload in &batch {
                self.listeners.dispatch(payload);
            }
        }
    }
}

/// One end of an in-process channel pair.
///
/// Delivery is a direct call into the peer's listeners. Payloads sent before
/// the peer calls [`TransportChannel::listen`] are buffered.
pub struct InProcessChannel {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    closed: Arc<AtomicBool>,
}

impl InProcessChannel {
    /// Create two connected endpoints, e.g. (server side, runner side).
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
                closed: Arc::clone(&closed),
            },
            Self {
                local: b,
                remote: a,
                closed,
            },
        )
    }
}

impl TransportChannel for InProcessChannel {
    fn send(&self, payload: HotPayload) {
        if self.closed.load(Ordering::Acquire) {
            trace!(kind = payload.kind(), "dropping send on closed in-process channel");
            return;
        }
        self.remote.deliver(payload);
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.local.listeners.add(listener)
    }

    fn off_message(&self, id: ListenerId) {
        self.local.listeners.remove(id);
    }

    fn listen(&self) {
        self.local.open();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.local.listeners.clear();
            self.remote.listeners.clear();
            self.local.gate.lock().backlog.clear();
            self.remote.gate.lock().backlog.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
