use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use super::namespace::ModuleNamespace;
use crate::error::RunnerError;

pub(crate) type SharedEvaluation =
    Shared<BoxFuture<'static, Result<Arc<ModuleNamespace>, RunnerError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Errored,
}

/// Runner-side record of one module.
pub struct EvaluatedModule {
    pub id: String,
    pub url: String,
    pub file: Option<String>,
    pub state: ModuleState,
    /// Ids of modules that imported this one.
    pub importers: BTreeSet<String>,
    /// Ids of modules this one imported.
    pub imports: BTreeSet<String>,
    pub exports: Arc<ModuleNamespace>,
    /// `t=` the module was last evaluated for.
    pub timestamp: u64,
    pub external: bool,
    pub(crate) evaluation: Option<SharedEvaluation>,
}

impl EvaluatedModule {
    fn new(id: &str, url: &str, file: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            file,
            state: ModuleState::Unloaded,
            importers: BTreeSet::new(),
            imports: BTreeSet::new(),
            exports: Arc::new(ModuleNamespace::new()),
            timestamp: 0,
            external: false,
            evaluation: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, EvaluatedModule>,
    url_to_id: HashMap<String, String>,
}

impl Inner {
    /// Whether walking importers upward from `importer` reaches `id`.
    fn reaches_importer(&self, importer: &str, id: &str) -> bool {
        let mut stack = vec![importer.to_string()];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == id {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(record) = self.by_id.get(&current) {
                stack.extend(record.importers.iter().cloned());
            }
        }
        false
    }
}

/// Every module the runner has fetched, keyed by resolved id.
#[derive(Default)]
pub struct EvaluatedModules {
    inner: Mutex<Inner>,
}

/// Summary of a record, for callers outside the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub id: String,
    pub url: String,
    pub state: ModuleState,
    pub timestamp: u64,
    pub importers: BTreeSet<String>,
}

impl EvaluatedModules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn id_for_url(&self, url: &str) -> Option<String> {
        self.inner.lock().url_to_id.get(url).cloned()
    }

    #[must_use]
    pub fn summary(&self, url: &str) -> Option<ModuleSummary> {
        let inner = self.inner.lock();
        let id = inner.url_to_id.get(url)?;
        inner.by_id.get(id).map(|m| ModuleSummary {
            id: m.id.clone(),
            url: m.url.clone(),
            state: m.state,
            timestamp: m.timestamp,
            importers: m.importers.clone(),
        })
    }

    /// Run `f` on the record for `id`, if present.
    pub(crate) fn with_module<R>(&self, id: &str, f: impl FnOnce(&mut EvaluatedModule) -> R) -> Option<R> {
        self.inner.lock().by_id.get_mut(id).map(f)
    }

    /// Get or create the record for `id`, then run `f` on it. `importer`
    /// is linked in both directions. `f` also learns whether `id` is
    /// `importer` or one of its transitive importers, checked under the
    /// same lock.
    pub(crate) fn ensure<R>(
        &self,
        id: &str,
        url: &str,
        file: Option<String>,
        importer: Option<&str>,
        f: impl FnOnce(&mut EvaluatedModule, bool) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let circular = importer.is_some_and(|importer| inner.reaches_importer(importer, id));
        inner.url_to_id.insert(url.to_string(), id.to_string());
        if let Some(importer) = importer {
            if let Some(record) = inner.by_id.get_mut(importer) {
                record.imports.insert(id.to_string());
            }
        }
        let record = inner
            .by_id
            .entry(id.to_string())
            .or_insert_with(|| EvaluatedModule::new(id, url, file));
        if let Some(importer) = importer {
            record.importers.insert(importer.to_string());
        }
        f(record, circular)
    }

    /// Link `importer -> id` for an already known module.
    pub(crate) fn link(&self, importer: &str, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.by_id.get_mut(importer) {
            record.imports.insert(id.to_string());
        }
        if let Some(record) = inner.by_id.get_mut(id) {
            record.importers.insert(importer.to_string());
        }
    }

    /// Whether `id` is `importer` itself or one of its transitive importers.
    #[must_use]
    pub fn is_circular_import(&self, importer: &str, id: &str) -> bool {
        self.inner.lock().reaches_importer(importer, id)
    }

    /// Forget a module's evaluation so the next import runs it again.
    /// Importer links are kept.
    pub fn invalidate(&self, id: &str) {
        if let Some(record) = self.inner.lock().by_id.get_mut(id) {
            record.state = ModuleState::Unloaded;
            record.evaluation = None;
            record.imports.clear();
            record.exports = Arc::new(ModuleNamespace::new());
        }
    }

    pub fn invalidate_url(&self, url: &str) {
        if let Some(id) = self.id_for_url(url) {
            self.invalidate(&id);
        }
    }

    /// Urls of evaluated modules nothing imports.
    #[must_use]
    pub fn entry_urls(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut urls: Vec<String> = inner
            .by_id
            .values()
            .filter(|m| m.importers.is_empty() && !m.external)
            .map(|m| m.url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Remove a module entirely, e.g. after the server pruned it.
    pub fn remove_url(&self, url: &str) {
        let mut inner = self.inner.lock();
        let Some(id) = inner.url_to_id.remove(url) else {
            return;
        };
        inner.url_to_id.retain(|_, v| *v != id);
        if let Some(record) = inner.by_id.remove(&id) {
            for other in record.imports.iter().chain(record.importers.iter()) {
                if let Some(other) = inner.by_id.get_mut(other) {
                    other.importers.remove(&id);
                    other.imports.remove(&id);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_id.clear();
        inner.url_to_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_links_both_directions() {
        let modules = EvaluatedModules::new();
        modules.ensure("/p/a.js", "/a.js", None, None, |_, _| ());
        modules.ensure("/p/b.js", "/b.js", None, Some("/p/a.js"), |_, _| ());

        let b = modules.summary("/b.js").unwrap();
        assert!(b.importers.contains("/p/a.js"));
        assert_eq!(modules.entry_urls(), vec!["/a.js".to_string()]);
    }

    #[test]
    fn test_circular_import_detection() {
        let modules = EvaluatedModules::new();
        modules.ensure("a", "/a.js", None, None, |_, _| ());
        modules.ensure("b", "/b.js", None, Some("a"), |_, _| ());
        modules.ensure("c", "/c.js", None, Some("b"), |_, _| ());

        assert!(modules.is_circular_import("c", "a"));
        assert!(modules.is_circular_import("b", "b"));
        assert!(!modules.is_circular_import("a", "c"));
    }

    #[test]
    fn test_invalidate_resets_evaluation_but_keeps_importers() {
        let modules = EvaluatedModules::new();
        modules.ensure("a", "/a.js", None, None, |_, _| ());
        modules.ensure("b", "/b.js", None, Some("a"), |m, _| m.state = ModuleState::Loaded);

        modules.invalidate_url("/b.js");
        let b = modules.summary("/b.js").unwrap();
        assert_eq!(b.state, ModuleState::Unloaded);
        assert!(b.importers.contains("a"));

        modules.remove_url("/b.js");
        assert!(modules.summary("/b.js").is_none());
        assert_eq!(modules.len(), 1);
    }
}
