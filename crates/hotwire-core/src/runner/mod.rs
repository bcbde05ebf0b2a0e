//! Module runner: evaluates server-transformed modules outside the browser.
//!
//! The runner fetches modules through a [`ModuleFetcher`], hands their code
//! to a [`ModuleEvaluator`], and caches the resulting namespaces in
//! [`EvaluatedModules`]. Concurrent imports of one module share a single
//! evaluation; an import that closes a cycle gets the partially populated
//! namespace instead of waiting on itself.
//!
//! With a transport channel attached the runner also applies hot updates:
//! payloads are handled one at a time, in arrival order.

mod evaluated;
mod fetch;
mod hot;
mod namespace;
mod sourcemap;

pub use evaluated::{EvaluatedModule, EvaluatedModules, ModuleState, ModuleSummary};
pub use fetch::{ChannelFetcher, ModuleFetcher, SessionFetcher, FETCH_TIMEOUT};
pub use hot::{AcceptKind, HmrClient, HotCallback, HotContext, HotData};
pub use namespace::{BindingKind, ModuleNamespace};
pub use sourcemap::{vlq_decode, OriginalPosition, SourceMapConsumer, StackFrame};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use hotwire_proto::{events, FetchResult, HotPayload, Update, UpdateKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::RunnerError;
use crate::graph::{inject_timestamp_query, strip_timestamp_query, timestamp_query};
use crate::transport::{ListenerId, TransportChannel};
use evaluated::SharedEvaluation;

/// Executes module code. The runner owns caching, cycles and hot updates;
/// the evaluator only runs one module at a time.
#[async_trait]
pub trait ModuleEvaluator: Send + Sync {
    /// Run transformed code, writing its exports into `context.exports()`.
    /// Imports go through `context.import`.
    async fn run_inlined_module(&self, context: ModuleContext, code: &str) -> Result<(), RunnerError>;

    /// Load a module the server left to the host.
    async fn run_external_module(&self, specifier: &str) -> Result<Arc<ModuleNamespace>, RunnerError>;
}

/// Everything an evaluating module can reach: its imports, its export
/// namespace and its hot context.
#[derive(Clone)]
pub struct ModuleContext {
    runner: ModuleRunner,
    id: String,
    url: String,
    file: Option<String>,
    imports: Arc<HashMap<String, String>>,
    exports: Arc<ModuleNamespace>,
    hot: Option<HotContext>,
    callstack: Vec<String>,
}

impl ModuleContext {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    #[must_use]
    pub fn exports(&self) -> &Arc<ModuleNamespace> {
        &self.exports
    }

    /// `import.meta.hot`, when the runner has a channel.
    #[must_use]
    pub fn hot(&self) -> Option<&HotContext> {
        self.hot.as_ref()
    }

    /// `import.meta`, minus `hot`.
    #[must_use]
    pub fn meta(&self) -> Value {
        let dirname = self
            .file
            .as_deref()
            .and_then(|f| f.rsplit_once('/').map(|(dir, _)| dir.to_string()));
        json!({
            "url": self.url,
            "filename": self.file,
            "dirname": dirname,
        })
    }

    /// Static import of `specifier`.
    ///
    /// # Errors
    /// Fetch or evaluation failure of the imported module.
    pub async fn import(&self, specifier: &str) -> Result<Arc<ModuleNamespace>, RunnerError> {
        let url = self.resolve(specifier);
        self.runner
            .cached_request(url, Some(self.id.clone()), self.callstack.clone())
            .await
    }

    /// `import()` of `specifier`. Runs outside the static import chain.
    ///
    /// # Errors
    /// Fetch or evaluation failure of the imported module.
    pub async fn dynamic_import(&self, specifier: &str) -> Result<Arc<ModuleNamespace>, RunnerError> {
        let url = self.resolve(specifier);
        self.runner
            .cached_request(url, Some(self.id.clone()), Vec::new())
            .await
    }

    fn resolve(&self, specifier: &str) -> String {
        if let Some(url) = self.imports.get(specifier) {
            return url.clone();
        }
        if specifier.starts_with('.') {
            return join_relative(&strip_timestamp_query(&self.url), specifier);
        }
        specifier.to_string()
    }
}

/// Resolve a relative specifier against the directory of `base`.
pub(crate) fn join_relative(base: &str, specifier: &str) -> String {
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    for part in specifier.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

struct RunnerInner {
    fetcher: Arc<dyn ModuleFetcher>,
    evaluator: Arc<dyn ModuleEvaluator>,
    modules: Arc<EvaluatedModules>,
    hmr: Option<Arc<HmrClient>>,
    channel: Option<Arc<dyn TransportChannel>>,
    listener: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

/// What a lookup in the evaluated modules found.
enum Cached {
    /// A module in the current import chain: hand out what it has so far.
    Partial(Arc<ModuleNamespace>),
    Pending(SharedEvaluation),
    Miss,
}

#[derive(Clone)]
pub struct ModuleRunner {
    inner: Arc<RunnerInner>,
}

impl ModuleRunner {
    /// A runner without hot updates.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ModuleFetcher>, evaluator: Arc<dyn ModuleEvaluator>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                fetcher,
                evaluator,
                modules: Arc::new(EvaluatedModules::new()),
                hmr: None,
                channel: None,
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A runner that applies hot payloads arriving on `channel`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn with_hmr(
        fetcher: Arc<dyn ModuleFetcher>,
        evaluator: Arc<dyn ModuleEvaluator>,
        channel: Arc<dyn TransportChannel>,
    ) -> Self {
        let modules = Arc::new(EvaluatedModules::new());
        let hmr = Arc::new(HmrClient::new(Arc::clone(&channel), Arc::clone(&modules)));
        let runner = Self {
            inner: Arc::new(RunnerInner {
                fetcher,
                evaluator,
                modules,
                hmr: Some(hmr),
                channel: Some(Arc::clone(&channel)),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<HotPayload>();
        let listener = channel.on_message(Arc::new(move |payload: &HotPayload| {
            if matches!(payload, HotPayload::Custom { event, .. } if event == events::FETCH_RESULT) {
                return;
            }
            let _ = tx.send(payload.clone());
        }));
        *runner.inner.listener.lock() = Some(listener);

        let weak: Weak<RunnerInner> = Arc::downgrade(&runner.inner);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ModuleRunner { inner }.handle_payload(payload).await;
            }
            trace!("module runner payload loop stopped");
        });
        channel.listen();
        runner
    }

    #[must_use]
    pub fn evaluated_modules(&self) -> &Arc<EvaluatedModules> {
        &self.inner.modules
    }

    #[must_use]
    pub fn hmr_client(&self) -> Option<&Arc<HmrClient>> {
        self.inner.hmr.as_ref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Import `url` as an entry point.
    ///
    /// # Errors
    /// Fetch or evaluation failure of the module or one of its imports.
    pub async fn import(&self, url: &str) -> Result<Arc<ModuleNamespace>, RunnerError> {
        self.cached_request(url.to_string(), None, Vec::new()).await
    }

    /// Forget every evaluated module and hot registration.
    pub fn clear_cache(&self) {
        self.inner.modules.clear();
        if let Some(hmr) = &self.inner.hmr {
            hmr.clear();
        }
    }

    /// Stop handling payloads and close the channel. Later imports fail
    /// with [`RunnerError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = &self.inner.channel {
            if let Some(listener) = self.inner.listener.lock().take() {
                channel.off_message(listener);
            }
            channel.close();
        }
        self.clear_cache();
        debug!("module runner closed");
    }

    fn cached_request(
        &self,
        url: String,
        importer: Option<String>,
        callstack: Vec<String>,
    ) -> BoxFuture<'static, Result<Arc<ModuleNamespace>, RunnerError>> {
        let runner = self.clone();
        async move {
            if runner.is_closed() {
                return Err(RunnerError::Closed);
            }
            let timestamp = timestamp_query(&url).unwrap_or(0);
            let clean = strip_timestamp_query(&url);

            if let Some(id) = runner.inner.modules.id_for_url(&clean) {
                match runner.lookup(&id, timestamp, importer.as_deref(), &callstack) {
                    Cached::Partial(exports) => return Ok(exports),
                    Cached::Pending(evaluation) => {
                        if let Some(importer) = &importer {
                            runner.inner.modules.link(importer, &id);
                        }
                        return evaluation.await;
                    }
                    Cached::Miss => {}
                }
            }

            let fetched = runner
                .inner
                .fetcher
                .fetch_module(&url, importer.as_deref())
                .await?;
            let (id, module_url, file) = match &fetched {
                FetchResult::Inlined { id, url, file, .. } => (id.clone(), url.clone(), file.clone()),
                FetchResult::External { specifier } => (specifier.clone(), clean.clone(), None),
            };

            let start = runner.inner.modules.ensure(&id, &module_url, file, importer.as_deref(), |m, circular| {
                if let Some(evaluation) = &m.evaluation {
                    // Another task may have started this module while we
                    // were fetching, with our importer already waiting on it
                    if m.state == ModuleState::Loading && (circular || callstack.contains(&m.id)) {
                        trace!(id = %m.id, "circular import, using partial exports");
                        return Err(Cached::Partial(Arc::clone(&m.exports)));
                    }
                    return Err(Cached::Pending(evaluation.clone()));
                }
                let exports = Arc::new(ModuleNamespace::new());
                let evaluation = runner
                    .clone()
                    .direct_request(id.clone(), fetched, Arc::clone(&exports), callstack.clone())
                    .boxed()
                    .shared();
                m.state = ModuleState::Loading;
                m.timestamp = timestamp;
                m.exports = exports;
                m.evaluation = Some(evaluation.clone());
                Ok(evaluation)
            });

            match start {
                Ok(evaluation) | Err(Cached::Pending(evaluation)) => evaluation.await,
                Err(Cached::Partial(exports)) => Ok(exports),
                Err(Cached::Miss) => Err(RunnerError::Fetch {
                    url,
                    message: "module record disappeared".to_string(),
                }),
            }
        }
        .boxed()
    }

    fn lookup(&self, id: &str, timestamp: u64, importer: Option<&str>, callstack: &[String]) -> Cached {
        let modules = &self.inner.modules;
        let stale = modules
            .with_module(id, |m| timestamp > m.timestamp)
            .unwrap_or(false);
        if stale {
            trace!(id, timestamp, "re-evaluating module for newer timestamp");
            modules.invalidate(id);
            return Cached::Miss;
        }

        let Some((state, evaluation, exports)) = modules
            .with_module(id, |m| {
                m.evaluation
                    .clone()
                    .map(|e| (m.state, e, Arc::clone(&m.exports)))
            })
            .flatten()
        else {
            return Cached::Miss;
        };

        if state == ModuleState::Loading {
            let circular = callstack.iter().any(|c| c == id)
                || importer.is_some_and(|importer| modules.is_circular_import(importer, id));
            if circular {
                trace!(id, "circular import, using partial exports");
                return Cached::Partial(exports);
            }
        }
        Cached::Pending(evaluation)
    }

    async fn direct_request(
        self,
        id: String,
        fetched: FetchResult,
        exports: Arc<ModuleNamespace>,
        mut callstack: Vec<String>,
    ) -> Result<Arc<ModuleNamespace>, RunnerError> {
        let (url, result) = match fetched {
            FetchResult::External { specifier } => {
                let result = self.inner.evaluator.run_external_module(&specifier).await;
                (specifier, result)
            }
            FetchResult::Inlined {
                url,
                file,
                code,
                map,
                imports,
                ..
            } => {
                let imports: Arc<HashMap<String, String>> = Arc::new(imports.into_iter().collect());
                let hot = self
                    .inner
                    .hmr
                    .as_ref()
                    .map(|client| HotContext::new(Arc::clone(client), &url, Arc::clone(&imports)));
                callstack.push(id.clone());
                let context = ModuleContext {
                    runner: self.clone(),
                    id: id.clone(),
                    url: url.clone(),
                    file,
                    imports,
                    exports: Arc::clone(&exports),
                    hot,
                    callstack,
                };
                let result = self
                    .inner
                    .evaluator
                    .run_inlined_module(context, &code)
                    .await
                    .map(|()| Arc::clone(&exports))
                    .map_err(|e| remap_error(e, &url, &id, map.as_deref(), &code));
                (url, result)
            }
        };

        // The record may have been invalidated while this evaluation ran;
        // only the evaluation that owns it updates it.
        let owned = self.inner.modules.with_module(&id, |m| {
            if !Arc::ptr_eq(&m.exports, &exports) {
                return false;
            }
            match &result {
                Ok(namespace) => {
                    m.state = ModuleState::Loaded;
                    if !Arc::ptr_eq(namespace, &exports) {
                        m.exports = Arc::clone(namespace);
                        m.external = true;
                    }
                }
                Err(_) => m.state = ModuleState::Errored,
            }
            true
        });
        if owned != Some(true) {
            trace!(id = %id, "evaluation finished for a superseded record");
        }
        if let Err(e) = &result {
            self.inner.fetcher.report_error(&url, e);
        }
        result
    }

    /// Apply one payload from the server.
    pub async fn handle_payload(&self, payload: HotPayload) {
        match payload {
            HotPayload::Connected => debug!("connected to dev server"),
            HotPayload::Update { updates } => {
                for update in updates {
                    match update.kind {
                        UpdateKind::JsUpdate => self.fetch_update(&update).await,
                        UpdateKind::CssUpdate => {
                            trace!(path = %update.path, "ignoring css update");
                        }
                    }
                }
            }
            HotPayload::FullReload { path, .. } => self.full_reload(path.as_deref()).await,
            HotPayload::Prune { paths } => {
                if let Some(hmr) = &self.inner.hmr {
                    hmr.prune_paths(&paths);
                }
            }
            HotPayload::Custom { event, data } => {
                if let Some(hmr) = &self.inner.hmr {
                    hmr.notify_listeners(&event, &data);
                }
            }
            HotPayload::Error { err } => {
                error!(message = %err.message, id = ?err.id, "dev server reported an error");
            }
        }
    }

    async fn fetch_update(&self, update: &Update) {
        let Some(hmr) = &self.inner.hmr else {
            return;
        };
        let path = strip_timestamp_query(&update.path);
        let accepted = strip_timestamp_query(&update.accepted_path);

        let qualified: Vec<HotCallback> = hmr
            .callbacks(&path)
            .into_iter()
            .filter(|cb| cb.deps(&path).contains(&accepted.as_str()))
            .collect();
        if qualified.is_empty() {
            debug!(path = %path, accepted = %accepted, "no accept handler for update");
            return;
        }

        hmr.dispose(&accepted);
        self.inner.modules.invalidate_url(&accepted);
        let url = inject_timestamp_query(&accepted, update.timestamp);
        match self.import(&url).await {
            Ok(namespace) => {
                for callback in qualified {
                    let modules: Vec<Option<Arc<ModuleNamespace>>> = callback
                        .deps(&path)
                        .into_iter()
                        .map(|dep| (dep == accepted).then(|| Arc::clone(&namespace)))
                        .collect();
                    callback.call(&modules);
                }
                debug!(path = %accepted, "hot updated");
            }
            Err(e) => {
                error!(path = %accepted, error = %e, "failed to apply hot update");
            }
        }
    }

    async fn full_reload(&self, path: Option<&str>) {
        let applies = match path {
            None | Some("*") => true,
            Some(path) => self.inner.modules.id_for_url(path).is_some(),
        };
        if !applies {
            trace!(path = ?path, "full reload does not touch this runner");
            return;
        }
        let entries = self.inner.modules.entry_urls();
        debug!(entries = entries.len(), "full reload");
        self.clear_cache();
        for url in entries {
            if let Err(e) = self.import(&url).await {
                warn!(url = %url, error = %e, "entry failed after full reload");
            }
        }
    }
}

/// Map stack frames of the failing module back to its original source.
fn remap_error(error: RunnerError, url: &str, id: &str, map: Option<&str>, code: &str) -> RunnerError {
    let RunnerError::Evaluation {
        id: error_id,
        message,
        stack,
    } = error
    else {
        return error;
    };
    let consumer = map
        .and_then(SourceMapConsumer::parse)
        .or_else(|| SourceMapConsumer::from_inline(code));
    let stack = match consumer {
        Some(consumer) => stack
            .into_iter()
            .map(|frame| {
                if frame.file != url && frame.file != id {
                    return frame;
                }
                consumer
                    .remap_frames(&frame.file, std::slice::from_ref(&frame))
                    .pop()
                    .unwrap_or(frame)
            })
            .collect(),
        None => stack,
    };
    RunnerError::Evaluation {
        id: error_id,
        message,
        stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// Serves modules from a map; each module's code is a list of lines
    /// understood by [`LineEvaluator`].
    #[derive(Default)]
    struct MapFetcher {
        modules: Mutex<HashMap<String, (String, Option<String>)>>,
        fetches: AtomicUsize,
        reported: Mutex<Vec<String>>,
        yield_first: bool,
    }

    impl MapFetcher {
        /// Give other tasks a turn before every fetch.
        fn yielding(mut self) -> Self {
            self.yield_first = true;
            self
        }

        fn with(self, url: &str, code: &str) -> Self {
            self.modules.lock().insert(url.to_string(), (code.to_string(), None));
            self
        }

        fn with_map(self, url: &str, code: &str, map: &str) -> Self {
            self.modules
                .lock()
                .insert(url.to_string(), (code.to_string(), Some(map.to_string())));
            self
        }
    }

    #[async_trait]
    impl ModuleFetcher for MapFetcher {
        async fn fetch_module(&self, url: &str, _importer: Option<&str>) -> Result<FetchResult, RunnerError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.yield_first {
                tokio::task::yield_now().await;
            }
            let clean = strip_timestamp_query(url);
            if !clean.starts_with('/') {
                return Ok(FetchResult::External { specifier: clean });
            }
            let (code, map) = self.modules.lock().get(&clean).cloned().ok_or_else(|| RunnerError::Fetch {
                url: url.to_string(),
                message: "not found".to_string(),
            })?;
            Ok(FetchResult::Inlined {
                id: format!("/root{clean}"),
                url: clean,
                file: None,
                code,
                map,
                imports: BTreeMap::new(),
            })
        }

        fn report_error(&self, url: &str, _error: &RunnerError) {
            self.reported.lock().push(url.to_string());
        }
    }

    /// Tiny line language: `import <spec>`, `let <name>`,
    /// `set <name> <value>`, `copy <name> <spec> <export>`,
    /// `throw <message>`.
    #[derive(Default)]
    struct LineEvaluator {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ModuleEvaluator for LineEvaluator {
        async fn run_inlined_module(&self, context: ModuleContext, code: &str) -> Result<(), RunnerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for (line_no, line) in code.lines().enumerate() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["import", spec] => {
                        context.import(spec).await?;
                    }
                    ["let", name] => context.exports().declare(name, BindingKind::Let, None),
                    ["set", name, value] => context.exports().set(name, Value::from(*value))?,
                    ["copy", name, spec, export] => {
                        let ns = context.import(spec).await?;
                        let value = ns.get(export)?.unwrap_or(Value::Null);
                        context.exports().set(name, value)?;
                    }
                    ["throw", message] => {
                        return Err(RunnerError::Evaluation {
                            id: context.id().to_string(),
                            message: (*message).to_string(),
                            stack: vec![StackFrame::new(
                                context.url(),
                                u32::try_from(line_no + 1).unwrap_or(u32::MAX),
                                5,
                            )],
                        });
                    }
                    _ => {}
                }
            }
            Ok(())
        }

        async fn run_external_module(&self, specifier: &str) -> Result<Arc<ModuleNamespace>, RunnerError> {
            Ok(Arc::new(ModuleNamespace::from_values([(
                "default".to_string(),
                Value::from(format!("external:{specifier}")),
            )])))
        }
    }

    fn runner(fetcher: MapFetcher) -> (ModuleRunner, Arc<MapFetcher>, Arc<LineEvaluator>) {
        let fetcher = Arc::new(fetcher);
        let evaluator = Arc::new(LineEvaluator::default());
        let runner = ModuleRunner::new(
            Arc::clone(&fetcher) as Arc<dyn ModuleFetcher>,
            Arc::clone(&evaluator) as Arc<dyn ModuleEvaluator>,
        );
        (runner, fetcher, evaluator)
    }

    #[tokio::test]
    async fn test_shared_dependency_evaluates_once() {
        let (runner, _fetcher, evaluator) = runner(
            MapFetcher::default()
                .with("/main.js", "import /a.js\nimport /b.js")
                .with("/a.js", "import /shared.js")
                .with("/b.js", "import /shared.js")
                .with("/shared.js", "set value 1"),
        );
        runner.import("/main.js").await.unwrap();
        assert_eq!(evaluator.runs.load(Ordering::SeqCst), 4);

        let shared = runner.evaluated_modules().summary("/shared.js").unwrap();
        assert_eq!(shared.state, ModuleState::Loaded);
        assert_eq!(shared.importers.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_imports_share_one_evaluation() {
        let (runner, fetcher, evaluator) = runner(MapFetcher::default().with("/a.js", "set value 1"));
        let (a, b) = tokio::join!(runner.import("/a.js"), runner.import("/a.js"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(evaluator.runs.load(Ordering::SeqCst), 1);
        assert!(fetcher.fetches.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_circular_import_gets_partial_namespace() {
        let (runner, _fetcher, _evaluator) = runner(
            MapFetcher::default()
                .with("/a.js", "let early\nimport /b.js\nset early ready")
                .with("/b.js", "copy seen /a.js early"),
        );
        let err = runner.import("/a.js").await.unwrap_err();
        assert_eq!(
            err,
            RunnerError::Uninitialized {
                name: "early".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_circular_import_reads_hoisted_var() {
        let (runner, _fetcher, _evaluator) = runner(
            MapFetcher::default()
                .with("/a.js", "set before yes\nimport /b.js\nset after yes")
                .with("/b.js", "copy seen /a.js before\ncopy missing /a.js after"),
        );
        runner.import("/a.js").await.unwrap();
        let b = runner.import("/b.js").await.unwrap();
        assert_eq!(b.get("seen"), Ok(Some(Value::from("yes"))));
        assert_eq!(b.get("missing"), Ok(Some(Value::Null)));
    }

    #[tokio::test]
    async fn test_cyclic_entries_imported_concurrently() {
        let (runner, _fetcher, evaluator) = runner(
            MapFetcher::default()
                .with("/a.js", "import /b.js\nset a 1")
                .with("/b.js", "import /a.js\nset b 1")
                .yielding(),
        );
        let (a, b) = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            async { tokio::join!(runner.import("/a.js"), runner.import("/b.js")) },
        )
        .await
        .expect("cyclic entries must not wait on each other");

        assert_eq!(a.unwrap().get("a"), Ok(Some(Value::from("1"))));
        assert_eq!(b.unwrap().get("b"), Ok(Some(Value::from("1"))));
        assert_eq!(evaluator.runs.load(Ordering::SeqCst), 2);
        for url in ["/a.js", "/b.js"] {
            assert_eq!(
                runner.evaluated_modules().summary(url).unwrap().state,
                ModuleState::Loaded
            );
        }
    }

    #[tokio::test]
    async fn test_newer_timestamp_reevaluates() {
        let (runner, _fetcher, evaluator) = runner(MapFetcher::default().with("/a.js", "set value 1"));
        runner.import("/a.js").await.unwrap();
        runner.import("/a.js").await.unwrap();
        assert_eq!(evaluator.runs.load(Ordering::SeqCst), 1);

        runner.import("/a.js?t=100").await.unwrap();
        runner.import("/a.js?t=50").await.unwrap();
        assert_eq!(evaluator.runs.load(Ordering::SeqCst), 2);
        assert_eq!(runner.evaluated_modules().summary("/a.js").unwrap().timestamp, 100);
    }

    #[tokio::test]
    async fn test_external_module() {
        let (runner, _fetcher, _evaluator) = runner(MapFetcher::default().with("/a.js", "copy dep react default"));
        let a = runner.import("/a.js").await.unwrap();
        assert_eq!(a.get("dep"), Ok(Some(Value::from("external:react"))));
    }

    #[tokio::test]
    async fn test_evaluation_error_is_remapped_and_reported() {
        let map = r#"{"version":3,"sources":["src/app.ts"],"names":["boom"],"mappings":"AAAA;IAEEA"}"#;
        let (runner, fetcher, _evaluator) = runner(MapFetcher::default().with_map("/app.js", "set x 1\nthrow kaput", map));

        let err = runner.import("/app.js").await.unwrap_err();
        let RunnerError::Evaluation { message, stack, .. } = &err else {
            panic!("expected evaluation error, got {err:?}");
        };
        assert_eq!(message, "kaput");
        assert_eq!(stack[0].to_string(), "boom (src/app.ts:3:3)");
        assert_eq!(*fetcher.reported.lock(), vec!["/app.js".to_string()]);
        assert_eq!(
            runner.evaluated_modules().summary("/app.js").unwrap().state,
            ModuleState::Errored
        );
    }

    #[tokio::test]
    async fn test_closed_runner_rejects_imports() {
        let (runner, _fetcher, _evaluator) = runner(MapFetcher::default().with("/a.js", ""));
        runner.close();
        assert_eq!(runner.import("/a.js").await.unwrap_err(), RunnerError::Closed);
    }

    #[test]
    fn test_join_relative() {
        assert_eq!(join_relative("/src/a/b.js", "./c.js"), "/src/a/c.js");
        assert_eq!(join_relative("/src/a/b.js", "../c.js"), "/src/c.js");
    }
}
