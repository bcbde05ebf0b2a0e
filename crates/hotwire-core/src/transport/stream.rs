use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hotwire_proto::{check_frame_len, decode_frame, encode_frame, HotPayload};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{ListenerId, Listeners, MessageListener, TransportChannel};
use crate::error::ChannelError;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Channel over a byte stream, one length-prefixed JSON frame per payload.
///
/// Must be created inside a tokio runtime: the writer task starts
/// immediately, the reader task on [`TransportChannel::listen`].
pub struct StreamChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<HotPayload>>>,
    listeners: Arc<Listeners>,
    reader: Mutex<Option<BoxedReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl StreamChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(write_loop(writer, rx, Arc::clone(&closed)));

        Self {
            tx: Mutex::new(Some(tx)),
            listeners: Arc::new(Listeners::default()),
            reader: Mutex::new(Some(Box::new(reader))),
            read_task: Mutex::new(None),
            closed,
        }
    }

    /// Split a duplex stream (e.g. `UnixStream`, `TcpStream`, `DuplexStream`).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<HotPayload>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = rx.recv().await {
        let result: Result<(), ChannelError> = async {
            let frame = encode_frame(&payload)?;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            debug!(error = %e, "stream channel write failed, closing");
            closed.store(true, Ordering::Release);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_frame<R>(reader: &mut R) -> Result<HotPayload, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let len = check_frame_len(reader.read_u32_le().await?)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(decode_frame(&buf)?)
}

async fn read_loop(mut reader: BoxedReader, listeners: Arc<Listeners>, closed: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(payload) => {
                trace!(kind = payload.kind(), "stream channel received payload");
                listeners.dispatch(&payload);
            }
            Err(ChannelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("stream channel peer closed");
                break;
            }
            Err(e) => {
                debug!(error = %e, "stream channel read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}

impl TransportChannel for StreamChannel {
    fn send(&self, payload: HotPayload) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(payload).is_err() {
                trace!("stream channel writer gone, dropping payload");
            }
        }
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn off_message(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn listen(&self) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        let handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.listeners),
            Arc::clone(&self.closed),
        ));
        *self.read_task.lock() = Some(handle);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender lets the writer flush what is queued and exit
        self.tx.lock().take();
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
        self.listeners.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.read_task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_channel_roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let server = StreamChannel::from_stream(a);
        let client = StreamChannel::from_stream(b);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_message(Arc::new(move |payload: &HotPayload| {
            let _ = tx.send(payload.clone());
        }));
        client.listen();

        server.send(HotPayload::Connected);
        server.send(HotPayload::Prune {
            paths: vec!["/src/old.js".to_string()],
        });

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, HotPayload::Connected);
        assert_eq!(
            second,
            HotPayload::Prune {
                paths: vec!["/src/old.js".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_peer_close_marks_channel_closed() {
        let (a, b) = tokio::io::duplex(64);
        let client = StreamChannel::from_stream(b);
        client.listen();
        drop(a);

        for _ in 0..50 {
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_closed());
        // Must not panic or error
        client.send(HotPayload::Connected);
    }
}
