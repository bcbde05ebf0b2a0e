use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hotwire_proto::{events, FetchRequest, FetchResponse, FetchResult, HotPayload};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::RunnerError;
use crate::session::DevSession;
use crate::transport::{ListenerId, TransportChannel};

/// How long a channel fetch waits for the server's reply.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a runner gets module code from.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch_module(&self, url: &str, importer: Option<&str>) -> Result<FetchResult, RunnerError>;

    /// Told about evaluation failures, so the server side can surface them.
    fn report_error(&self, _url: &str, _error: &RunnerError) {}
}

/// Fetches by calling a [`DevSession`] in the same process.
pub struct SessionFetcher {
    session: Arc<DevSession>,
}

impl SessionFetcher {
    #[must_use]
    pub fn new(session: Arc<DevSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ModuleFetcher for SessionFetcher {
    async fn fetch_module(&self, url: &str, importer: Option<&str>) -> Result<FetchResult, RunnerError> {
        self.session
            .fetch_module(url, importer)
            .await
            .map_err(|e| RunnerError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    fn report_error(&self, url: &str, error: &RunnerError) {
        self.session.record_ssr_error(url, &error.to_string());
    }
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<FetchResponse>>>;

/// Fetches over a transport channel with the `hotwire:fetch` request and
/// `hotwire:fetch-result` reply events.
pub struct ChannelFetcher {
    channel: Arc<dyn TransportChannel>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    listener: ListenerId,
}

impl ChannelFetcher {
    #[must_use]
    pub fn new(channel: Arc<dyn TransportChannel>) -> Arc<Self> {
        let pending: Arc<Pending> = Arc::default();
        let replies = Arc::clone(&pending);
        let listener = channel.on_message(Arc::new(move |payload: &HotPayload| {
            let HotPayload::Custom { event, data } = payload else {
                return;
            };
            if event != events::FETCH_RESULT {
                return;
            }
            match serde_json::from_value::<FetchResponse>(data.clone()) {
                Ok(response) => {
                    if let Some(tx) = replies.lock().remove(&response.id) {
                        let _ = tx.send(response);
                    } else {
                        debug!(id = response.id, "fetch reply with no pending request");
                    }
                }
                Err(e) => warn!(error = %e, "malformed fetch reply"),
            }
        }));
        channel.listen();
        Arc::new(Self {
            channel,
            pending,
            next_id: AtomicU64::new(1),
            listener,
        })
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for ChannelFetcher {
    fn drop(&mut self) {
        self.channel.off_message(self.listener);
    }
}

#[async_trait]
impl ModuleFetcher for ChannelFetcher {
    async fn fetch_module(&self, url: &str, importer: Option<&str>) -> Result<FetchResult, RunnerError> {
        if self.channel.is_closed() {
            return Err(RunnerError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = FetchRequest {
            id,
            url: url.to_string(),
            importer: importer.map(str::to_string),
        };
        let payload = HotPayload::custom(events::FETCH, &request).map_err(|e| RunnerError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        self.channel.send(payload);

        let response = match tokio::time::timeout(FETCH_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RunnerError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(RunnerError::Fetch {
                    url: url.to_string(),
                    message: format!("no reply within {}s", FETCH_TIMEOUT.as_secs()),
                });
            }
        };

        match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, error) => Err(RunnerError::Fetch {
                url: url.to_string(),
                message: error.unwrap_or_else(|| "empty fetch reply".to_string()),
            }),
        }
    }
}
