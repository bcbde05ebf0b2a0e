//! Dependency pre-bundling.
//!
//! The optimizer discovers bare imports, hands them to an external
//! [`DepBundler`] in one batch, and publishes the result as an immutable
//! [`OptimizerSnapshot`]. Readers clone the current `Arc`; a rebuild swaps
//! it in a single assignment, so a request never sees half a bundle set.
//!
//! On disk the set lives in `<cache_dir>/deps` next to `_metadata.json`.
//! A build writes to `<cache_dir>/deps_temp_<hash>` first and renames it
//! into place once complete.

mod metadata;
mod scan;

pub use metadata::{
    browser_hash, compute_hash, lockfile_fingerprint, OptimizedDepInfo, OptimizerMetadata,
    OptimizerSnapshot, LOCKFILES, METADATA_FILE,
};
pub use scan::{
    apply_filters, default_entries, flatten_id, is_bare_specifier, is_excluded,
    package_name_from_specifier, scan_imports,
};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hotwire_proto::{ErrorPayload, HotPayload};
use hotwire_util::fs::{remove_dir_if_exists, replace_dir};
use hotwire_util::hash::short_hash;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::DevConfig;
use crate::error::OptimizerError;
use crate::graph::{ModuleGraph, ResolvedId};
use crate::transform::Transformer;
use crate::transport::HotBroadcaster;

/// Url prefix under which optimized bundles are served.
pub const DEPS_URL_PREFIX: &str = "/@deps/";

/// Name reported as the `plugin` of optimizer error payloads.
const ERROR_SOURCE: &str = "hotwire:optimize-deps";

/// Input to one bundler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    pub root: PathBuf,
    pub specifiers: BTreeSet<String>,
    pub define: BTreeMap<String, String>,
    pub mode: String,
}

/// One bundled dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundledDep {
    pub code: String,
    /// The package is CommonJS and needs a default-export interop shim.
    pub needs_interop: bool,
}

/// The external production bundler.
#[async_trait]
pub trait DepBundler: Send + Sync {
    /// Bundle every specifier of `request` in one run.
    ///
    /// Returns one output per specifier. Specifiers missing from the result
    /// are served unoptimized.
    async fn bundle(
        &self,
        request: BundleRequest,
    ) -> Result<BTreeMap<String, BundledDep>, OptimizerError>;
}

/// Where a bare import is served from once optimized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedDep {
    /// Browser url, `/@deps/<file>?v=<browser_hash>`.
    pub url: String,
    /// Resolved identity (the bundle's absolute path).
    pub id: String,
    pub file: PathBuf,
    pub needs_interop: bool,
}

pub struct DependencyOptimizer {
    config: DevConfig,
    cache_dir: PathBuf,
    transformer: Arc<dyn Transformer>,
    bundler: Arc<dyn DepBundler>,
    graph: Arc<RwLock<ModuleGraph>>,
    hot: Arc<HotBroadcaster>,
    current: RwLock<Option<Arc<OptimizerSnapshot>>>,
    discovered: Mutex<BTreeSet<String>>,
    scheduled: Mutex<Option<(u64, CancellationToken)>>,
    schedule_seq: AtomicU64,
    run_lock: tokio::sync::Mutex<()>,
    bundle_runs: AtomicU64,
}

impl DependencyOptimizer {
    pub fn new(
        config: &DevConfig,
        transformer: Arc<dyn Transformer>,
        bundler: Arc<dyn DepBundler>,
        graph: Arc<RwLock<ModuleGraph>>,
        hot: Arc<HotBroadcaster>,
    ) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            config: config.clone(),
            transformer,
            bundler,
            graph,
            hot,
            current: RwLock::new(None),
            discovered: Mutex::new(BTreeSet::new()),
            scheduled: Mutex::new(None),
            schedule_seq: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
            bundle_runs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn deps_dir(&self) -> PathBuf {
        self.cache_dir.join("deps")
    }

    /// The published snapshot, if any build or load succeeded.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<OptimizerSnapshot>> {
        self.current.read().clone()
    }

    #[must_use]
    pub fn metadata(&self) -> Option<Arc<OptimizerMetadata>> {
        self.snapshot().map(|s| Arc::clone(&s.metadata))
    }

    /// How many times the bundler has been invoked.
    #[must_use]
    pub fn bundle_runs(&self) -> u64 {
        self.bundle_runs.load(Ordering::Relaxed)
    }

    /// Every specifier known so far, scanned or discovered while serving.
    #[must_use]
    pub fn discovered(&self) -> BTreeSet<String> {
        self.discovered.lock().clone()
    }

    /// Scan the default entries and build or load the initial set.
    ///
    /// Errors are reported and swallowed: the server then serves raw
    /// resolution until a later re-optimization succeeds.
    pub async fn run_initial(&self) -> Option<Arc<OptimizerMetadata>> {
        if self.config.optimize_deps.disabled {
            debug!("dependency optimization disabled");
            return None;
        }
        let entries = default_entries(&self.config.root, &self.config.optimize_deps);
        let scanned = self.scan(&entries).await;
        let discovered = {
            let mut known = self.discovered.lock();
            known.extend(scanned);
            known.clone()
        };
        match self.build_or_load(&discovered).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                self.report_error(&e);
                None
            }
        }
    }

    /// Bare specifiers reachable from `entries`, after include/exclude.
    pub async fn scan(&self, entries: &[String]) -> BTreeSet<String> {
        let scanned = scan_imports(self.transformer.as_ref(), entries).await;
        apply_filters(&self.config.optimize_deps, scanned)
    }

    #[must_use]
    pub fn compute_hash(&self, discovered: &BTreeSet<String>) -> String {
        let lockfile = lockfile_fingerprint(&self.config.root);
        compute_hash(&self.config, discovered, lockfile.as_deref())
    }

    /// Publish the optimized set for `discovered`, bundling only if neither
    /// the current snapshot nor the metadata on disk matches its hash.
    ///
    /// # Errors
    /// Returns an error if bundling or writing the output fails. The
    /// previous snapshot stays published in that case.
    pub async fn build_or_load(
        &self,
        discovered: &BTreeSet<String>,
    ) -> Result<Arc<OptimizerMetadata>, OptimizerError> {
        self.build_or_load_inner(discovered, None).await
    }

    async fn build_or_load_inner(
        &self,
        discovered: &BTreeSet<String>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<OptimizerMetadata>, OptimizerError> {
        let _guard = self.run_lock.lock().await;
        let hash = self.compute_hash(discovered);

        if let Some(current) = self.metadata() {
            if current.hash == hash {
                trace!(hash = %hash, "optimized deps already current");
                return Ok(current);
            }
        }

        let deps_dir = self.deps_dir();
        if !self.config.optimize_deps.force {
            match OptimizerMetadata::read(&deps_dir) {
                Ok(Some(cached)) if cached.hash == hash => {
                    match OptimizerSnapshot::load(cached, deps_dir.clone()) {
                        Ok(snapshot) => {
                            info!(hash = %hash, deps = discovered.len(), "reusing optimized deps from cache");
                            return Ok(self.publish(snapshot));
                        }
                        Err(e) => warn!(error = %e, "cached optimized deps are incomplete, rebuilding"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring unreadable optimizer metadata"),
            }
        }

        let request = BundleRequest {
            root: self.config.root.clone(),
            specifiers: discovered.clone(),
            define: self.config.define.clone(),
            mode: self.config.mode.clone(),
        };
        info!(hash = %hash, deps = discovered.len(), "optimizing dependencies");
        self.bundle_runs.fetch_add(1, Ordering::Relaxed);
        let bundle = self.bundler.bundle(request);
        let outputs = match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(OptimizerError::Cancelled),
                outputs = bundle => outputs,
            },
            None => bundle.await,
        }?;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(OptimizerError::Cancelled);
        }

        let temp_dir = self.cache_dir.join(format!("deps_temp_{hash}"));
        match write_deps_dir(&temp_dir, &deps_dir, hash, discovered, outputs) {
            Ok(snapshot) => Ok(self.publish(snapshot)),
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&temp_dir) {
                    debug!(error = %cleanup, "failed to clean up optimizer temp dir");
                }
                Err(e)
            }
        }
    }

    fn publish(&self, snapshot: OptimizerSnapshot) -> Arc<OptimizerMetadata> {
        let metadata = Arc::clone(&snapshot.metadata);
        self.discovered.lock().extend(metadata.discovered_set());
        *self.current.write() = Some(Arc::new(snapshot));
        metadata
    }

    /// Record a bare import first seen while serving and schedule a rebuild.
    ///
    /// Returns the prospective bundle info, or `None` if the specifier is
    /// excluded, already optimized or already waiting for a rebuild.
    pub fn register_missing_import(self: &Arc<Self>, specifier: &str) -> Option<OptimizedDepInfo> {
        if self.config.optimize_deps.disabled
            || is_excluded(&self.config.optimize_deps, specifier)
            || self.resolve_optimized(specifier).is_some()
        {
            return None;
        }
        if !self.discovered.lock().insert(specifier.to_string()) {
            return None;
        }
        info!(specifier, "new dependency discovered, scheduling re-optimization");
        self.schedule_reoptimize();
        Some(OptimizedDepInfo {
            file: format!("{}.js", flatten_id(specifier)),
            needs_interop: false,
            file_hash: String::new(),
        })
    }

    /// Rebuild after the debounce window. A newer call cancels this one,
    /// including a run that is already bundling.
    pub fn schedule_reoptimize(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let seq = self.schedule_seq.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.scheduled.lock().replace((seq, token.clone())) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let debounce = self.config.optimize_deps.debounce();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    trace!(seq, "re-optimization superseded before it started");
                    return;
                }
                () = tokio::time::sleep(debounce) => {}
            }
            this.reoptimize(&token).await;

            let mut scheduled = this.scheduled.lock();
            if scheduled.as_ref().is_some_and(|(current, _)| *current == seq) {
                *scheduled = None;
            }
        });
    }

    async fn reoptimize(&self, token: &CancellationToken) {
        let previous = self.metadata().map(|m| m.hash.clone());
        let discovered = self.discovered();
        match self.build_or_load_inner(&discovered, Some(token)).await {
            Ok(metadata) if previous.as_deref() != Some(metadata.hash.as_str()) => {
                info!(hash = %metadata.hash, "optimized deps changed, reloading clients");
                self.graph.write().invalidate_all();
                self.hot.send(HotPayload::full_reload());
            }
            Ok(_) => trace!("re-optimization produced the same set"),
            Err(OptimizerError::Cancelled) => debug!("re-optimization superseded"),
            Err(e) => self.report_error(&e),
        }
    }

    fn report_error(&self, e: &OptimizerError) {
        error!(error = %e, "dependency optimization failed");
        let mut err = ErrorPayload::new(e.to_string());
        err.plugin = Some(ERROR_SOURCE.to_string());
        self.hot.send(HotPayload::Error { err });
    }

    /// Optimized location of a bare import, if the current set has it.
    #[must_use]
    pub fn resolve_optimized(&self, specifier: &str) -> Option<OptimizedDep> {
        let snapshot = self.snapshot()?;
        let info = snapshot.metadata.optimized.get(specifier)?;
        let file = snapshot.dir.join(&info.file);
        Some(OptimizedDep {
            url: format!(
                "{DEPS_URL_PREFIX}{}?v={}",
                info.file, snapshot.metadata.browser_hash
            ),
            id: file.to_string_lossy().into_owned(),
            file,
            needs_interop: info.needs_interop,
        })
    }

    /// Resolve a `/@deps/<file>` url to the bundle it names.
    #[must_use]
    pub fn resolve_deps_url(&self, url: &str) -> Option<ResolvedId> {
        let file = deps_file_of(url)?;
        let snapshot = self.snapshot()?;
        snapshot.code(file)?;
        let path = snapshot.dir.join(file);
        Some(ResolvedId::new(path.to_string_lossy().into_owned(), Some(path)))
    }

    /// Bundle text of `file` in the current snapshot.
    #[must_use]
    pub fn optimized_code(&self, file: &str) -> Option<Arc<str>> {
        self.snapshot()?.code(file)
    }

    #[must_use]
    pub fn optimized_code_for_url(&self, url: &str) -> Option<Arc<str>> {
        self.optimized_code(deps_file_of(url)?)
    }

    /// Cancel a pending re-optimization.
    pub fn close(&self) {
        if let Some((_, token)) = self.scheduled.lock().take() {
            token.cancel();
        }
    }
}

fn deps_file_of(url: &str) -> Option<&str> {
    let rest = url.strip_prefix(DEPS_URL_PREFIX)?;
    let file = rest.split(['?', '#']).next()?;
    (!file.is_empty() && !file.contains("..")).then_some(file)
}

/// Write bundles and metadata to `temp_dir`, then move it to `deps_dir`.
fn write_deps_dir(
    temp_dir: &Path,
    deps_dir: &Path,
    hash: String,
    discovered: &BTreeSet<String>,
    outputs: BTreeMap<String, BundledDep>,
) -> Result<OptimizerSnapshot, OptimizerError> {
    remove_dir_if_exists(temp_dir).map_err(|e| OptimizerError::io(temp_dir, e))?;
    std::fs::create_dir_all(temp_dir).map_err(|e| OptimizerError::io(temp_dir, e))?;

    let mut optimized = BTreeMap::new();
    let mut code = HashMap::with_capacity(outputs.len());
    let mut owners: HashMap<String, String> = HashMap::with_capacity(outputs.len());
    for (specifier, dep) in outputs {
        if !discovered.contains(&specifier) {
            warn!(specifier = %specifier, "bundler returned an unrequested dependency");
            continue;
        }
        let file = format!("{}.js", flatten_id(&specifier));
        if let Some(first) = owners.insert(file.clone(), specifier.clone()) {
            return Err(OptimizerError::FileCollision {
                file,
                first,
                second: specifier,
            });
        }
        let path = temp_dir.join(&file);
        std::fs::write(&path, &dep.code).map_err(|e| OptimizerError::io(&path, e))?;
        optimized.insert(
            specifier,
            OptimizedDepInfo {
                file: file.clone(),
                needs_interop: dep.needs_interop,
                file_hash: short_hash([dep.code.as_bytes()]),
            },
        );
        code.insert(file, Arc::from(dep.code));
    }

    let metadata = OptimizerMetadata {
        browser_hash: browser_hash(&hash, &optimized),
        hash,
        optimized,
        discovered: discovered.iter().map(|spec| (spec.clone(), true)).collect(),
    };
    metadata.write(temp_dir)?;
    replace_dir(temp_dir, deps_dir).map_err(|e| OptimizerError::io(deps_dir, e))?;
    debug!(dir = %deps_dir.display(), deps = metadata.optimized.len(), "wrote optimized deps");

    Ok(OptimizerSnapshot::new(metadata, deps_dir.to_path_buf(), code))
}
