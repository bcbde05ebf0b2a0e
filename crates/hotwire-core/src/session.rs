//! One dev server session.
//!
//! [`DevSession`] owns the module graph, the transform cache, the optimizer,
//! the HMR engine and the broadcaster for one project root. Everything that
//! would otherwise be process-global hangs off this object, so several
//! sessions can live in one process (tests do this constantly).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hotwire_proto::{
    events, ErrorPayload, FetchRequest, FetchResponse, FetchResult, HotPayload, InvalidateMessage,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::DevConfig;
use crate::error::{ResolveError, TransformError};
use crate::graph::{inject_timestamp_query, strip_timestamp_query, ModuleGraph, TransformResult};
use crate::hmr::{HmrEngine, HmrOutcome};
use crate::optimizer::{is_bare_specifier, DepBundler, DependencyOptimizer, OptimizerMetadata};
use crate::transform::{TransformCache, Transformer};
use crate::transport::{ClientId, ClientMessage, HotBroadcaster, TransportChannel};

/// Server-side handler for a custom event sent by a client.
pub type ClientEventHandler = Arc<dyn Fn(ClientId, &Value) + Send + Sync>;

/// Kind of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

pub struct DevSession {
    config: DevConfig,
    graph: Arc<RwLock<ModuleGraph>>,
    transformer: Arc<dyn Transformer>,
    transforms: Arc<TransformCache>,
    optimizer: Option<Arc<DependencyOptimizer>>,
    hmr: HmrEngine,
    hot: Arc<HotBroadcaster>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    inbox_task: Mutex<Option<JoinHandle<()>>>,
    handlers: RwLock<HashMap<String, Vec<ClientEventHandler>>>,
    closed: AtomicBool,
}

impl DevSession {
    /// Wire up a session. Without a bundler, dependencies are never
    /// optimized and bare imports resolve through the transformer.
    #[must_use]
    pub fn new(
        config: DevConfig,
        transformer: Arc<dyn Transformer>,
        bundler: Option<Arc<dyn DepBundler>>,
    ) -> Arc<Self> {
        let graph = Arc::new(RwLock::new(ModuleGraph::new()));
        let (hot, inbox) = HotBroadcaster::new();
        let hot = Arc::new(hot);

        let optimizer = bundler.map(|bundler| {
            Arc::new(DependencyOptimizer::new(
                &config,
                Arc::clone(&transformer),
                bundler,
                Arc::clone(&graph),
                Arc::clone(&hot),
            ))
        });
        let transforms = Arc::new(TransformCache::new(
            config.root.clone(),
            Arc::clone(&graph),
            Arc::clone(&transformer),
            optimizer.clone(),
            Arc::clone(&hot),
        ));
        let hmr = HmrEngine::new(
            config.root.clone(),
            config.hmr.enabled,
            Arc::clone(&graph),
            Arc::clone(&transformer),
            Arc::clone(&hot),
        );

        Arc::new(Self {
            config,
            graph,
            transformer,
            transforms,
            optimizer,
            hmr,
            hot,
            inbox: Mutex::new(Some(inbox)),
            inbox_task: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Start handling client messages and run the initial dependency
    /// optimization. Must be called inside a tokio runtime.
    pub async fn start(self: &Arc<Self>) -> Option<Arc<OptimizerMetadata>> {
        if let Some(mut inbox) = self.inbox.lock().take() {
            let session: Weak<Self> = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    session.handle_client_message(message);
                }
                trace!("session inbox closed");
            });
            *self.inbox_task.lock() = Some(task);
        }

        let metadata = match &self.optimizer {
            Some(optimizer) => optimizer.run_initial().await,
            None => None,
        };
        info!(root = %self.config.root.display(), "dev session started");
        metadata
    }

    #[must_use]
    pub fn config(&self) -> &DevConfig {
        &self.config
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<RwLock<ModuleGraph>> {
        &self.graph
    }

    #[must_use]
    pub fn transforms(&self) -> &Arc<TransformCache> {
        &self.transforms
    }

    #[must_use]
    pub fn optimizer(&self) -> Option<&Arc<DependencyOptimizer>> {
        self.optimizer.as_ref()
    }

    #[must_use]
    pub fn hot(&self) -> &Arc<HotBroadcaster> {
        &self.hot
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serve a url requested directly by a client.
    ///
    /// A module nothing imports yet becomes an entry. Transform failures
    /// other than "not found" are also broadcast as `error` payloads.
    ///
    /// # Errors
    /// Resolution or transform failure of the module.
    pub async fn transform_request(&self, url: &str) -> Result<Arc<TransformResult>, TransformError> {
        let result = self.transforms.request(url).await;
        match &result {
            Ok(_) => {
                let mut graph = self.graph.write();
                let entry = graph
                    .get_by_url(url)
                    .filter(|node| node.importers.is_empty() && !node.is_entry)
                    .map(|node| node.id);
                if let Some(id) = entry {
                    debug!(url, "module requested as entry");
                    graph.mark_entry(id);
                }
            }
            Err(e) if e.is_not_found() => debug!(url, "module not found"),
            Err(e) => self.report_transform_error(e),
        }
        result
    }

    /// What a module runner gets for `url`.
    ///
    /// Imports of hot-updated modules carry their `?t=` so the runner
    /// re-evaluates them.
    ///
    /// # Errors
    /// Resolution or transform failure of the module.
    pub async fn fetch_module(&self, url: &str, importer: Option<&str>) -> Result<FetchResult, TransformError> {
        let clean = strip_timestamp_query(url);
        let clean = if clean.starts_with('/') {
            clean
        } else if is_bare_specifier(&clean) {
            return Ok(FetchResult::External { specifier: clean });
        } else {
            let resolved = self
                .transformer
                .resolve_id(&clean, importer)
                .await?
                .ok_or_else(|| ResolveError::new(&clean, importer))?;
            if resolved.external {
                return Ok(FetchResult::External { specifier: resolved.id });
            }
            self.transforms.url_for(&resolved)
        };

        let result = self.transform_request(&clean).await?;
        let graph = self.graph.read();
        let node = graph
            .get_by_url(&clean)
            .ok_or_else(|| TransformError::failed(&clean, "module was removed from the graph"))?;
        let imports: BTreeMap<String, String> = result
            .imports
            .iter()
            .map(|(specifier, dep_url)| {
                let dep_url = match graph.get_by_url(dep_url) {
                    Some(dep) if dep.last_hmr_timestamp > 0 => {
                        inject_timestamp_query(dep_url, dep.last_hmr_timestamp)
                    }
                    _ => dep_url.clone(),
                };
                (specifier.clone(), dep_url)
            })
            .collect();

        Ok(FetchResult::Inlined {
            id: node.resolved_id.clone(),
            url: node.url.clone(),
            file: node.file.as_ref().map(|f| f.to_string_lossy().into_owned()),
            code: result.code.clone(),
            map: result.map.clone(),
            imports,
        })
    }

    /// Propagate changed files and broadcast the outcome.
    pub fn handle_file_change(&self, files: &[PathBuf]) -> HmrOutcome {
        self.hmr.handle_file_change(files)
    }

    /// Handle a batch of file system events of one kind.
    pub fn handle_file_event(&self, kind: FileEventKind, files: &[PathBuf]) -> HmrOutcome {
        match kind {
            FileEventKind::Change => self.handle_file_change(files),
            FileEventKind::Add => {
                let known: Vec<PathBuf> = {
                    let mut graph = self.graph.write();
                    files
                        .iter()
                        .filter(|file| !graph.on_file_add(file).is_empty())
                        .cloned()
                        .collect()
                };
                if known.is_empty() {
                    trace!(files = files.len(), "added files back no module");
                    HmrOutcome::NoOp
                } else {
                    self.handle_file_change(&known)
                }
            }
            FileEventKind::Unlink => {
                let removed: Vec<_> = {
                    let mut graph = self.graph.write();
                    files.iter().flat_map(|file| graph.on_file_unlink(file)).collect()
                };
                let outcome = self.handle_file_change(files);
                let pruned = self.graph.write().prune(removed);
                if !pruned.is_empty() {
                    self.hot.send(HotPayload::Prune { paths: pruned });
                }
                outcome
            }
        }
    }

    /// Register a client connection. It receives `connected` right away.
    pub fn connect_client(&self, channel: Arc<dyn TransportChannel>) -> ClientId {
        self.hot.add_client(channel)
    }

    pub fn disconnect_client(&self, client: ClientId) {
        self.hot.remove_client(client);
    }

    /// Handle custom `event`s sent by clients.
    pub fn on_client_event(&self, event: &str, handler: ClientEventHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Record a runner-side execution error on the module.
    pub fn record_ssr_error(&self, url: &str, message: &str) {
        let mut graph = self.graph.write();
        let id = graph.get_by_url(url).map(|node| node.id);
        if let Some(id) = id {
            graph.record_ssr_error(id, message);
        }
    }

    /// Stop the session: cancel pending optimizer work and close every
    /// client. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(optimizer) = &self.optimizer {
            optimizer.close();
        }
        self.hot.close();
        if let Some(task) = self.inbox_task.lock().take() {
            task.abort();
        }
        info!("dev session closed");
    }

    fn report_transform_error(&self, e: &TransformError) {
        error!(error = %e, "transform failed");
        let mut err = ErrorPayload::new(e.to_string());
        if let TransformError::Failed { id, plugin, .. } = e {
            err.id = Some(id.clone());
            err.plugin = plugin.clone();
        }
        self.hot.send(HotPayload::Error { err });
    }

    fn handle_client_message(self: &Arc<Self>, message: ClientMessage) {
        let ClientMessage { client, payload } = message;
        let (event, data) = match payload {
            HotPayload::Custom { event, data } => (event, data),
            other => {
                trace!(kind = other.kind(), "ignoring client payload");
                return;
            }
        };
        match event.as_str() {
            events::INVALIDATE => match serde_json::from_value::<InvalidateMessage>(data) {
                Ok(request) => {
                    self.hmr
                        .invalidate_from_client(&request.path, request.message.as_deref());
                }
                Err(e) => warn!(error = %e, "malformed invalidate message"),
            },
            events::FETCH => match serde_json::from_value::<FetchRequest>(data) {
                Ok(request) => {
                    let session = Arc::clone(self);
                    tokio::spawn(async move {
                        session.answer_fetch(client, request).await;
                    });
                }
                Err(e) => warn!(error = %e, "malformed fetch request"),
            },
            _ => {
                let handlers = self.handlers.read().get(&event).cloned().unwrap_or_default();
                if handlers.is_empty() {
                    debug!(event = %event, "no handler for client event");
                }
                for handler in handlers {
                    handler(client, &data);
                }
            }
        }
    }

    async fn answer_fetch(&self, client: ClientId, request: FetchRequest) {
        let response = match self.fetch_module(&request.url, request.importer.as_deref()).await {
            Ok(result) => FetchResponse {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(e) => FetchResponse {
                id: request.id,
                result: None,
                error: Some(e.to_string()),
            },
        };
        match HotPayload::custom(events::FETCH_RESULT, &response) {
            Ok(payload) => self.hot.send_to(client, payload),
            Err(e) => warn!(error = %e, "failed to encode fetch reply"),
        }
    }
}

impl Drop for DevSession {
    fn drop(&mut self) {
        self.close();
    }
}
