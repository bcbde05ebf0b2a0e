//! WebSocket binding of the HMR transport.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hotwire_core::transport::{ListenerId, Listeners, MessageListener, TransportChannel};
use hotwire_proto::HotPayload;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One browser connection on `/__hmr`, JSON text frames both ways.
pub struct WsChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<HotPayload>>>,
    listeners: Arc<Listeners>,
    incoming: Mutex<Option<SplitStream<WebSocket>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl WsChannel {
    /// Wrap an upgraded socket. Must be called inside a tokio runtime.
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        tokio::spawn(write_loop(sink, rx, Arc::clone(&closed)));

        Self {
            tx: Mutex::new(Some(tx)),
            listeners: Arc::new(Listeners::default()),
            incoming: Mutex::new(Some(stream)),
            read_task: Mutex::new(None),
            closed,
        }
    }

    /// Resolves once either side closed the connection.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<HotPayload>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(payload) = rx.recv().await {
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, "failed to encode hmr payload");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(error = %e, "websocket write failed, closing");
            break;
        }
    }
    closed.send_replace(true);
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    listeners: Arc<Listeners>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<HotPayload>(&text) {
                Ok(payload) => {
                    trace!(kind = payload.kind(), "websocket received payload");
                    listeners.dispatch(&payload);
                }
                Err(e) => debug!(error = %e, "ignoring malformed hmr message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }
    closed.send_replace(true);
}

impl TransportChannel for WsChannel {
    fn send(&self, payload: HotPayload) {
        if self.is_closed() {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(payload);
        }
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn off_message(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn listen(&self) {
        let Some(stream) = self.incoming.lock().take() else {
            return;
        };
        let handle = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.listeners),
            Arc::clone(&self.closed),
        ));
        *self.read_task.lock() = Some(handle);
    }

    fn close(&self) {
        self.closed.send_replace(true);
        // The writer drains what is queued, then sends a close frame
        self.tx.lock().take();
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
        self.listeners.clear();
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.read_task.get_mut().take() {
            handle.abort();
        }
    }
}
