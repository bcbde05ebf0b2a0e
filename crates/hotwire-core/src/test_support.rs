//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{OptimizerError, TransformError};
use crate::graph::ResolvedId;
use crate::optimizer::{is_bare_specifier, BundleRequest, BundledDep, DepBundler};
use crate::transform::{TransformOutput, Transformer};

/// Serves source text from a map of root-relative urls.
pub(crate) struct MemoryTransformer {
    root: PathBuf,
    files: RwLock<HashMap<String, String>>,
    delay: Option<Duration>,
    transforms: Mutex<HashMap<String, usize>>,
}

impl MemoryTransformer {
    pub(crate) fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: RwLock::new(HashMap::new()),
            delay: None,
            transforms: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_file(self, url: &str, code: &str) -> Self {
        self.set_file(url, code);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_file(&self, url: &str, code: &str) {
        self.files.write().insert(url.to_string(), code.to_string());
    }

    pub(crate) fn transform_count(&self, id: &str) -> usize {
        self.transforms.lock().get(id).copied().unwrap_or_default()
    }

    fn id_for(&self, url: &str) -> String {
        format!("{}{url}", self.root.to_string_lossy())
    }

    fn url_for(&self, id: &str) -> Option<String> {
        id.strip_prefix(self.root.to_string_lossy().as_ref())
            .map(ToString::to_string)
    }
}

/// Resolve `specifier` against the directory of the root-relative `importer`.
pub(crate) fn join_url(importer: &str, specifier: &str) -> String {
    let mut segments: Vec<&str> = importer.split('/').filter(|s| !s.is_empty()).collect();
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

#[async_trait]
impl Transformer for MemoryTransformer {
    async fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolvedId>, TransformError> {
        if is_bare_specifier(specifier) {
            return Ok(Some(ResolvedId::external(specifier)));
        }
        let url = match (specifier.starts_with('/'), importer.and_then(|i| self.url_for(i))) {
            (true, _) => specifier.split('?').next().unwrap_or(specifier).to_string(),
            (false, Some(importer_url)) => join_url(&importer_url, specifier),
            (false, None) => return Ok(None),
        };
        if !self.files.read().contains_key(&url) {
            return Ok(None);
        }
        let id = self.id_for(&url);
        let file = self.root.join(url.trim_start_matches('/'));
        Ok(Some(ResolvedId::new(id, Some(file))))
    }

    async fn transform(&self, module: &ResolvedId) -> Result<TransformOutput, TransformError> {
        *self.transforms.lock().entry(module.id.clone()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let code = self
            .url_for(&module.id)
            .and_then(|url| self.files.read().get(&url).cloned())
            .ok_or_else(|| TransformError::failed(&module.id, "file not found"))?;
        TransformOutput::analyze(code, None)
            .map_err(|e| TransformError::failed(&module.id, e.to_string()))
    }
}

/// Bundler that emits a one-line module per specifier.
#[derive(Default)]
pub(crate) struct StubBundler {
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
    last: Mutex<Option<BundleRequest>>,
}

impl StubBundler {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub(crate) fn last_request(&self) -> Option<BundleRequest> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl DepBundler for StubBundler {
    async fn bundle(
        &self,
        request: BundleRequest,
    ) -> Result<BTreeMap<String, BundledDep>, OptimizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(request.clone());
        if let Some(message) = self.failure.lock().clone() {
            return Err(OptimizerError::Bundle(message));
        }
        Ok(request
            .specifiers
            .into_iter()
            .map(|spec| {
                let code = format!("export default '{spec}';\n");
                (spec, BundledDep { code, needs_interop: false })
            })
            .collect())
    }
}
