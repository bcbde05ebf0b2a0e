//! Transform pipeline and cache.
//!
//! [`TransformCache`] turns a url into a [`TransformResult`]:
//!
//! 1. serve the node's cached result if it is valid for the node's epoch;
//! 2. otherwise resolve the url (a failure never creates a node);
//! 3. join an in-flight transform for the same url started under the same
//!    epoch, or start one;
//! 4. when the external transformer finishes, resolve its imports, record
//!    the edges in the graph and store the result, unless the node was
//!    invalidated meanwhile, in which case the result is discarded and the
//!    transform retried.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use hotwire_proto::HotPayload;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::analysis::{analyze_module, ImportRecord, LexError};
use crate::error::{ResolveError, TransformError};
use crate::graph::{ModuleGraph, ModuleId, ModuleInfoUpdate, ResolvedId, TransformResult};
use crate::optimizer::{is_bare_specifier, DependencyOptimizer, DEPS_URL_PREFIX};
use crate::transport::HotBroadcaster;

/// How many times a transform is retried when its module keeps being
/// invalidated before the result can be stored.
const MAX_TRANSFORM_ATTEMPTS: u32 = 4;

/// What an external transformer returns for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    pub map: Option<String>,
    pub imports: Vec<ImportRecord>,
    /// Importer-relative specifiers passed to `hot.accept(deps, cb)`.
    pub accepted_deps: Vec<String>,
    pub accepted_exports: Option<Vec<String>>,
    pub self_accepting: bool,
}

impl TransformOutput {
    /// Build an output by scanning `code` for imports and accept calls.
    ///
    /// # Errors
    /// Returns an error if a `hot.accept` call cannot be read statically.
    pub fn analyze(code: impl Into<String>, map: Option<String>) -> Result<Self, LexError> {
        let code = code.into();
        let analysis = analyze_module(&code)?;
        Ok(Self {
            code,
            map,
            imports: analysis.imports,
            accepted_deps: analysis.accepted_deps,
            accepted_exports: analysis.accepted_exports,
            self_accepting: analysis.self_accepting,
        })
    }
}

/// The external transformer: resolution and code transformation.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Map a specifier to a module. `importer` is the importer's resolved id,
    /// `None` for urls requested directly. `Ok(None)` means "not found".
    async fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolvedId>, TransformError>;

    /// Load and transform a resolved module.
    async fn transform(&self, module: &ResolvedId) -> Result<TransformOutput, TransformError>;

    /// Narrow the modules affected by a file change. Defaults to all of them.
    fn handle_hot_update(&self, _file: &Path, modules: Vec<ModuleId>) -> Vec<ModuleId> {
        modules
    }
}

type SharedTransform = Shared<BoxFuture<'static, Result<Arc<TransformResult>, TransformError>>>;

struct PendingTransform {
    epoch: u64,
    future: SharedTransform,
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    /// Requests answered from a node's cached result.
    pub hits: u64,
    /// External transforms started.
    pub transforms: u64,
    /// Requests that joined an in-flight transform.
    pub coalesced: u64,
    /// Results thrown away because the node was invalidated mid-flight.
    pub discarded: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    transforms: AtomicU64,
    coalesced: AtomicU64,
    discarded: AtomicU64,
}

/// A resolved import of a module being transformed.
struct ResolvedImport {
    specifier: String,
    url: String,
    resolved: ResolvedId,
    bindings: Option<BTreeSet<String>>,
    dynamic: bool,
}

pub struct TransformCache {
    root: PathBuf,
    graph: Arc<RwLock<ModuleGraph>>,
    transformer: Arc<dyn Transformer>,
    optimizer: Option<Arc<DependencyOptimizer>>,
    hot: Arc<HotBroadcaster>,
    pending: Mutex<HashMap<String, PendingTransform>>,
    stats: StatCounters,
}

impl TransformCache {
    pub fn new(
        root: impl Into<PathBuf>,
        graph: Arc<RwLock<ModuleGraph>>,
        transformer: Arc<dyn Transformer>,
        optimizer: Option<Arc<DependencyOptimizer>>,
        hot: Arc<HotBroadcaster>,
    ) -> Self {
        Self {
            root: root.into(),
            graph,
            transformer,
            optimizer,
            hot,
            pending: Mutex::new(HashMap::new()),
            stats: StatCounters::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> TransformStats {
        TransformStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            transforms: self.stats.transforms.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }

    /// Transform the module at `url`, reusing cached or in-flight work.
    pub async fn request(self: &Arc<Self>, url: &str) -> Result<Arc<TransformResult>, TransformError> {
        let url = crate::graph::strip_timestamp_query(url);

        if let Some(result) = self.cached(&url) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(result);
        }

        let resolved = self.resolve_request(&url).await?;
        let (id, epoch) = {
            let mut graph = self.graph.write();
            let id = graph.resolve_url(&url, &resolved);
            (id, graph.epoch_of(id).unwrap_or_default())
        };

        let future = {
            let mut pending = self.pending.lock();
            match pending.get(&url) {
                Some(existing) if existing.epoch == epoch => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(url = %url, "joining in-flight transform");
                    existing.future.clone()
                }
                _ => {
                    let future = Arc::clone(self)
                        .run_transform(url.clone(), id, resolved)
                        .boxed()
                        .shared();
                    pending.insert(
                        url.clone(),
                        PendingTransform {
                            epoch,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        let result = future.await;

        let mut pending = self.pending.lock();
        if pending.get(&url).is_some_and(|p| p.epoch == epoch) {
            pending.remove(&url);
        }
        result
    }

    fn cached(&self, url: &str) -> Option<Arc<TransformResult>> {
        let graph = self.graph.read();
        let node = graph.get_by_url(url)?;
        let result = node.transform_result.as_ref()?;
        (result.epoch == node.transform_epoch).then(|| Arc::clone(result))
    }

    async fn resolve_request(&self, url: &str) -> Result<ResolvedId, TransformError> {
        if url.starts_with(DEPS_URL_PREFIX) {
            return self
                .optimizer
                .as_ref()
                .and_then(|optimizer| optimizer.resolve_deps_url(url))
                .ok_or_else(|| ResolveError::new(url, None).into());
        }
        match self.transformer.resolve_id(url, None).await? {
            Some(resolved) if !resolved.external => Ok(resolved),
            _ => Err(ResolveError::new(url, None).into()),
        }
    }

    async fn run_transform(
        self: Arc<Self>,
        url: String,
        id: ModuleId,
        resolved: ResolvedId,
    ) -> Result<Arc<TransformResult>, TransformError> {
        for attempt in 1..=MAX_TRANSFORM_ATTEMPTS {
            let Some(epoch) = self.graph.read().epoch_of(id) else {
                return Err(TransformError::failed(&url, "module was removed from the graph"));
            };

            self.stats.transforms.fetch_add(1, Ordering::Relaxed);
            debug!(url = %url, attempt, "transforming module");

            let output = if url.starts_with(DEPS_URL_PREFIX) {
                self.load_optimized(&url)?
            } else {
                self.transformer.transform(&resolved).await?
            };
            let imports = self.resolve_imports(&resolved.id, &output.imports).await?;
            let accepted = self.resolve_accepted(&resolved.id, &output.accepted_deps, &imports).await?;

            let result = Arc::new(TransformResult {
                code: output.code,
                map: output.map,
                imports: imports
                    .iter()
                    .map(|i| (i.specifier.clone(), i.url.clone()))
                    .collect(),
                dynamic_imports: imports
                    .iter()
                    .filter(|i| i.dynamic)
                    .map(|i| i.url.clone())
                    .collect(),
                accepted_deps: accepted.iter().map(|(url, _)| url.clone()).collect(),
                epoch,
            });

            let pruned = {
                let mut graph = self.graph.write();
                if graph.epoch_of(id) != Some(epoch) {
                    self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(url = %url, "discarding stale transform result");
                    continue;
                }

                let mut update = ModuleInfoUpdate {
                    accepted_exports: output
                        .accepted_exports
                        .map(|names| names.into_iter().collect()),
                    self_accepting: output.self_accepting,
                    ..ModuleInfoUpdate::default()
                };
                for import in &imports {
                    if import.resolved.external {
                        continue;
                    }
                    let dep = graph.resolve_url(&import.url, &import.resolved);
                    update.imported.insert(dep);
                    let bindings = update.imported_bindings.entry(dep).or_default();
                    match &import.bindings {
                        Some(names) => bindings.extend(names.iter().cloned()),
                        None => {
                            bindings.insert("*".to_string());
                        }
                    }
                }
                for (dep_url, dep_resolved) in &accepted {
                    let dep = graph.resolve_url(dep_url, dep_resolved);
                    update.accepted_deps.insert(dep);
                }

                let dropped = graph.update_module_info(id, update);
                graph.set_transform_result(id, Arc::clone(&result));
                graph.prune(dropped)
            };

            if !pruned.is_empty() {
                self.hot.send(HotPayload::Prune { paths: pruned });
            }
            return Ok(result);
        }

        Err(TransformError::Invalidated {
            id: url,
            attempts: MAX_TRANSFORM_ATTEMPTS,
        })
    }

    fn load_optimized(&self, url: &str) -> Result<TransformOutput, TransformError> {
        let code = self
            .optimizer
            .as_ref()
            .and_then(|optimizer| optimizer.optimized_code_for_url(url))
            .ok_or_else(|| TransformError::from(ResolveError::new(url, None)))?;
        Ok(TransformOutput {
            code: code.to_string(),
            ..TransformOutput::default()
        })
    }

    async fn resolve_imports(
        &self,
        importer: &str,
        records: &[ImportRecord],
    ) -> Result<Vec<ResolvedImport>, TransformError> {
        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            let (url, module) = self.resolve_import(&record.specifier, importer).await?;
            resolved.push(ResolvedImport {
                specifier: record.specifier.clone(),
                url,
                resolved: module,
                bindings: record.bindings.clone(),
                dynamic: record.dynamic,
            });
        }
        Ok(resolved)
    }

    async fn resolve_accepted(
        &self,
        importer: &str,
        specifiers: &[String],
        imports: &[ResolvedImport],
    ) -> Result<Vec<(String, ResolvedId)>, TransformError> {
        let mut accepted = Vec::with_capacity(specifiers.len());
        let mut seen = HashSet::new();
        for specifier in specifiers {
            let entry = match imports.iter().find(|i| &i.specifier == specifier) {
                Some(import) => (import.url.clone(), import.resolved.clone()),
                None => self.resolve_import(specifier, importer).await?,
            };
            if seen.insert(entry.0.clone()) {
                accepted.push(entry);
            }
        }
        Ok(accepted)
    }

    /// Resolve one import specifier to (url, resolved id).
    ///
    /// Bare specifiers go to the optimizer first. An unknown bare import is
    /// reported as newly discovered and served unoptimized until the
    /// re-optimization finishes and triggers a full reload.
    async fn resolve_import(
        &self,
        specifier: &str,
        importer: &str,
    ) -> Result<(String, ResolvedId), TransformError> {
        if is_bare_specifier(specifier) {
            if let Some(optimizer) = &self.optimizer {
                if let Some(dep) = optimizer.resolve_optimized(specifier) {
                    return Ok((dep.url, ResolvedId::new(dep.id, Some(dep.file))));
                }
                optimizer.register_missing_import(specifier);
            }
        }

        let resolved = self
            .transformer
            .resolve_id(specifier, Some(importer))
            .await?
            .ok_or_else(|| {
                TransformError::failed(
                    importer,
                    ResolveError::new(specifier, Some(importer)).to_string(),
                )
            })?;
        if resolved.external {
            return Ok((specifier.to_string(), resolved));
        }
        Ok((self.url_for(&resolved), resolved))
    }

    /// Public url of a resolved module.
    #[must_use]
    pub fn url_for(&self, resolved: &ResolvedId) -> String {
        let query = resolved
            .id
            .split_once('?')
            .map(|(_, q)| format!("?{q}"))
            .unwrap_or_default();
        match &resolved.file {
            Some(file) => match file.strip_prefix(&self.root) {
                Ok(rel) => format!("/{}{query}", to_url_path(rel)),
                Err(_) => format!("/@fs/{}{query}", to_url_path(file).trim_start_matches('/')),
            },
            None if resolved.id.starts_with('/') => resolved.id.clone(),
            None => format!("/@id/{}", resolved.id),
        }
    }
}

fn to_url_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
