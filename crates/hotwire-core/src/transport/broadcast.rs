use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hotwire_proto::HotPayload;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ListenerId, TransportChannel};

/// Identifies one connected client of a [`HotBroadcaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

/// A payload received from a client.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub client: ClientId,
    pub payload: HotPayload,
}

struct Client {
    id: ClientId,
    channel: Arc<dyn TransportChannel>,
    listener: ListenerId,
}

/// Server side of the HMR transport: fans payloads out to every client.
///
/// New clients receive `connected` on registration. An `error` sent while no
/// client is connected is kept and delivered to the next client, so an
/// error raised during startup still reaches the first browser tab.
pub struct HotBroadcaster {
    clients: RwLock<Vec<Client>>,
    next_id: AtomicU64,
    inbox: mpsc::UnboundedSender<ClientMessage>,
    buffered_error: Mutex<Option<HotPayload>>,
}

impl HotBroadcaster {
    /// Create a broadcaster and the receiver of everything clients send.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                clients: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                inbox,
                buffered_error: Mutex::new(None),
            },
            rx,
        )
    }

    /// Register a client channel and start listening on it.
    pub fn add_client(&self, channel: Arc<dyn TransportChannel>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let inbox = self.inbox.clone();
        let listener = channel.on_message(Arc::new(move |payload: &HotPayload| {
            let _ = inbox.send(ClientMessage {
                client: id,
                payload: payload.clone(),
            });
        }));
        channel.listen();
        channel.send(HotPayload::Connected);
        if let Some(error) = self.buffered_error.lock().take() {
            channel.send(error);
        }

        self.clients.write().push(Client {
            id,
            channel,
            listener,
        });
        debug!(client = id.0, "hmr client connected");
        id
    }

    pub fn remove_client(&self, id: ClientId) {
        let removed = {
            let mut clients = self.clients.write();
            clients
                .iter()
                .position(|c| c.id == id)
                .map(|idx| clients.swap_remove(idx))
        };
        if let Some(client) = removed {
            client.channel.off_message(client.listener);
            client.channel.close();
            debug!(client = id.0, "hmr client disconnected");
        }
    }

    /// Send to every live client. Closed clients are dropped on the way.
    pub fn send(&self, payload: HotPayload) {
        // Snapshot so no lock is held while in-process listeners run
        let targets: Vec<Arc<dyn TransportChannel>> = {
            let mut clients = self.clients.write();
            clients.retain(|c| !c.channel.is_closed());
            clients.iter().map(|c| Arc::clone(&c.channel)).collect()
        };

        if targets.is_empty() {
            if matches!(payload, HotPayload::Error { .. }) {
                *self.buffered_error.lock() = Some(payload);
            } else {
                trace!(kind = payload.kind(), "no hmr clients, dropping payload");
            }
            return;
        }
        for channel in targets {
            channel.send(payload.clone());
        }
    }

    /// Send to a single client, e.g. an RPC reply.
    pub fn send_to(&self, id: ClientId, payload: HotPayload) {
        let target = self
            .clients
            .read()
            .iter()
            .find(|c| c.id == id)
            .map(|c| Arc::clone(&c.channel));
        if let Some(channel) = target {
            channel.send(payload);
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .iter()
            .filter(|c| !c.channel.is_closed())
            .count()
    }

    /// Close every client channel.
    pub fn close(&self) {
        let clients = std::mem::take(&mut *self.clients.write());
        for client in clients {
            client.channel.off_message(client.listener);
            client.channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessChannel;
    use hotwire_proto::ErrorPayload;

    fn client_log(channel: &InProcessChannel) -> Arc<Mutex<Vec<HotPayload>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        channel.on_message(Arc::new(move |payload: &HotPayload| {
            sink.lock().push(payload.clone());
        }));
        channel.listen();
        log
    }

    #[test]
    fn test_new_client_gets_connected_then_broadcasts() {
        let (hot, _rx) = HotBroadcaster::new();
        let (server_end, client_end) = InProcessChannel::pair();
        let log = client_log(&client_end);

        hot.add_client(Arc::new(server_end));
        hot.send(HotPayload::full_reload());

        let log = log.lock();
        assert_eq!(log[0], HotPayload::Connected);
        assert_eq!(log[1], HotPayload::full_reload());
    }

    #[test]
    fn test_error_is_buffered_until_a_client_connects() {
        let (hot, _rx) = HotBroadcaster::new();
        let error = HotPayload::Error {
            err: ErrorPayload::new("boom"),
        };
        hot.send(error.clone());

        let (server_end, client_end) = InProcessChannel::pair();
        let log = client_log(&client_end);
        hot.add_client(Arc::new(server_end));

        assert_eq!(*log.lock(), vec![HotPayload::Connected, error]);
    }

    #[test]
    fn test_client_messages_reach_inbox_and_closed_clients_are_dropped() {
        let (hot, mut rx) = HotBroadcaster::new();
        let (server_end, client_end) = InProcessChannel::pair();
        client_end.listen();
        let id = hot.add_client(Arc::new(server_end));

        client_end.send(HotPayload::Custom {
            event: "ping".to_string(),
            data: serde_json::Value::Null,
        });
        let message = rx.try_recv().unwrap();
        assert_eq!(message.client, id);
        assert_eq!(message.payload.kind(), "custom");

        client_end.close();
        hot.send(HotPayload::full_reload());
        assert_eq!(hot.client_count(), 0);
    }
}
