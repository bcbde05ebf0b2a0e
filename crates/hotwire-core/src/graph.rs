//! Module graph.
//!
//! An arena of [`ModuleNode`]s addressed by [`ModuleId`]. Edges are sets of
//! ids kept symmetric (`a.imported_modules ∋ b ⇔ b.importers ∋ a`), so the
//! graph can hold arbitrary cycles without shared ownership. Every walk over
//! the graph uses an explicit work list and visited set.
//!
//! The graph is the single source of truth for module state; nothing outside
//! this module mutates a node.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

/// Arena index of a module node. Never reused within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    Js,
    Css,
}

const CSS_EXTENSIONS: &[&str] = &[".css", ".scss", ".sass", ".less", ".styl", ".pcss"];

impl ModuleType {
    /// Classify a url by the extension of its path component.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if CSS_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            Self::Css
        } else {
            Self::Js
        }
    }
}

/// Result of resolving a url or specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedId {
    /// Resolved identity, including any query.
    pub id: String,
    /// Backing file, `None` for virtual modules.
    pub file: Option<PathBuf>,
    /// Left to the host instead of being served by the dev server.
    pub external: bool,
}

impl ResolvedId {
    #[must_use]
    pub fn new(id: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            file,
            external: false,
        }
    }

    #[must_use]
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file: None,
            external: true,
        }
    }
}

/// Cached output of one transform, valid for exactly one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    /// Specifier as written → resolved url, for every static and dynamic import.
    pub imports: Vec<(String, String)>,
    /// Urls imported only through `import()`.
    pub dynamic_imports: BTreeSet<String>,
    /// Urls this module hot-accepts.
    pub accepted_deps: BTreeSet<String>,
    /// Epoch this result was computed under.
    pub epoch: u64,
}

/// One resolvable module.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub id: ModuleId,
    /// Public url, timestamp query stripped.
    pub url: String,
    /// Resolved identity.
    pub resolved_id: String,
    pub file: Option<PathBuf>,
    pub module_type: ModuleType,
    pub imported_modules: BTreeSet<ModuleId>,
    pub importers: BTreeSet<ModuleId>,
    /// Binding names imported from each dependency, when known.
    pub imported_bindings: HashMap<ModuleId, BTreeSet<String>>,
    pub accepted_hmr_deps: BTreeSet<ModuleId>,
    pub accepted_hmr_exports: Option<BTreeSet<String>>,
    pub is_self_accepting: bool,
    pub is_entry: bool,
    pub last_hmr_timestamp: u64,
    pub transform_epoch: u64,
    pub transform_result: Option<Arc<TransformResult>>,
    /// Last execution error reported by a module runner.
    pub ssr_error: Option<String>,
}

impl ModuleNode {
    fn new(id: ModuleId, url: String, resolved: &ResolvedId) -> Self {
        Self {
            id,
            module_type: ModuleType::from_url(&url),
            url,
            resolved_id: resolved.id.clone(),
            file: resolved.file.clone(),
            imported_modules: BTreeSet::new(),
            importers: BTreeSet::new(),
            imported_bindings: HashMap::new(),
            accepted_hmr_deps: BTreeSet::new(),
            accepted_hmr_exports: None,
            is_self_accepting: false,
            is_entry: false,
            last_hmr_timestamp: 0,
            transform_epoch: 0,
            transform_result: None,
            ssr_error: None,
        }
    }

    /// True if the node has no valid transform result for its epoch.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.transform_result
            .as_ref()
            .map_or(true, |r| r.epoch != self.transform_epoch)
    }
}

/// New metadata for a module after a transform.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfoUpdate {
    pub imported: BTreeSet<ModuleId>,
    pub imported_bindings: HashMap<ModuleId, BTreeSet<String>>,
    pub accepted_deps: BTreeSet<ModuleId>,
    pub accepted_exports: Option<BTreeSet<String>>,
    pub self_accepting: bool,
}

#[derive(Debug, Default)]
pub struct ModuleGraph {
    nodes: HashMap<ModuleId, ModuleNode>,
    next_id: u32,
    url_to_module: HashMap<String, ModuleId>,
    resolved_to_module: HashMap<String, ModuleId>,
    file_to_modules: HashMap<PathBuf, BTreeSet<ModuleId>>,
}

impl ModuleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(&id)
    }

    /// Look up a node by public url. The timestamp query is ignored.
    #[must_use]
    pub fn get_by_url(&self, url: &str) -> Option<&ModuleNode> {
        let url = strip_timestamp_query(url);
        self.url_to_module.get(&url).and_then(|id| self.nodes.get(id))
    }

    #[must_use]
    pub fn get_by_resolved_id(&self, resolved_id: &str) -> Option<&ModuleNode> {
        self.resolved_to_module
            .get(resolved_id)
            .and_then(|id| self.nodes.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    /// Url of a node, for logging and payloads.
    #[must_use]
    pub fn url_of(&self, id: ModuleId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.url.as_str())
    }

    /// Get or create the node for `url`.
    ///
    /// Idempotent. Two urls that resolve to the same identity share a node.
    pub fn resolve_url(&mut self, url: &str, resolved: &ResolvedId) -> ModuleId {
        let url = strip_timestamp_query(url);
        if let Some(&id) = self.url_to_module.get(&url) {
            return id;
        }
        if let Some(&id) = self.resolved_to_module.get(&resolved.id) {
            self.url_to_module.insert(url, id);
            return id;
        }

        let id = ModuleId(self.next_id);
        self.next_id += 1;

        trace!(url = %url, resolved = %resolved.id, "creating module node");
        if let Some(file) = &resolved.file {
            self.file_to_modules
                .entry(file.clone())
                .or_default()
                .insert(id);
        }
        self.url_to_module.insert(url.clone(), id);
        self.resolved_to_module.insert(resolved.id.clone(), id);
        self.nodes.insert(id, ModuleNode::new(id, url, resolved));
        id
    }

    /// All nodes backed by `file` (one per query variant).
    #[must_use]
    pub fn ensure_entry_from_file(&self, file: &Path) -> Vec<ModuleId> {
        self.file_to_modules
            .get(file)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// A file appeared on disk. Nodes it already backs (a file removed and
    /// recreated) are invalidated and returned for propagation.
    pub fn on_file_add(&mut self, file: &Path) -> Vec<ModuleId> {
        let ids = self.ensure_entry_from_file(file);
        let mut seen = HashSet::new();
        for &id in &ids {
            self.invalidate_module(id, &mut seen, None);
        }
        ids
    }

    /// A file was removed. Its nodes lose entry status, so they are pruned
    /// as soon as no importer references them.
    pub fn on_file_unlink(&mut self, file: &Path) -> Vec<ModuleId> {
        let ids = self.ensure_entry_from_file(file);
        for id in &ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.is_entry = false;
            }
        }
        ids
    }

    /// Mark a node as directly requested by a client. Entries are never pruned.
    pub fn mark_entry(&mut self, id: ModuleId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.is_entry = true;
        }
    }

    /// Replace a module's forward edges and acceptance metadata.
    ///
    /// Returns the dependencies that lost their last importer because of this
    /// update (candidates for [`ModuleGraph::prune`]).
    pub fn update_module_info(&mut self, id: ModuleId, update: ModuleInfoUpdate) -> Vec<ModuleId> {
        let next: BTreeSet<ModuleId> = update
            .imported
            .into_iter()
            .filter(|dep| self.nodes.contains_key(dep))
            .collect();
        let Some(node) = self.nodes.get_mut(&id) else {
            return Vec::new();
        };

        let previous = std::mem::replace(&mut node.imported_modules, next.clone());
        node.imported_bindings = update.imported_bindings;
        node.accepted_hmr_deps = update.accepted_deps;
        node.accepted_hmr_exports = update.accepted_exports;
        node.is_self_accepting = update.self_accepting;

        let mut no_longer_imported = Vec::new();
        for dep in previous.difference(&next) {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.importers.remove(&id);
                if is_unreachable(dep_node) {
                    no_longer_imported.push(*dep);
                }
            }
        }
        for dep in next.difference(&previous) {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.importers.insert(id);
            }
        }

        self.debug_assert_consistent();
        no_longer_imported
    }

    /// Mark a node dirty: bump its epoch and drop its transform result.
    ///
    /// `seen` guards repeated calls within one walk; `timestamp` stamps
    /// `last_hmr_timestamp` when the invalidation comes from a hot update.
    pub fn invalidate_module(
        &mut self,
        id: ModuleId,
        seen: &mut HashSet<ModuleId>,
        timestamp: Option<u64>,
    ) {
        if !seen.insert(id) {
            return;
        }
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.transform_epoch += 1;
        node.transform_result = None;
        node.ssr_error = None;
        if let Some(ts) = timestamp {
            node.last_hmr_timestamp = ts;
        }
        trace!(url = %node.url, epoch = node.transform_epoch, "invalidated module");
    }

    /// Invalidate every node, e.g. after the optimized dependency set changed.
    pub fn invalidate_all(&mut self) {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let ids: Vec<ModuleId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.invalidate_module(id, &mut seen, None);
        }
        debug!(modules = seen.len(), "invalidated all modules");
    }

    /// Current epoch of a node.
    #[must_use]
    pub fn epoch_of(&self, id: ModuleId) -> Option<u64> {
        self.nodes.get(&id).map(|n| n.transform_epoch)
    }

    /// Store a transform result if the node is still at `result.epoch`.
    ///
    /// Returns `false` (and stores nothing) when the node was invalidated
    /// while the transform ran.
    pub fn set_transform_result(&mut self, id: ModuleId, result: Arc<TransformResult>) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.transform_epoch == result.epoch => {
                node.transform_result = Some(result);
                true
            }
            _ => false,
        }
    }

    pub fn record_ssr_error(&mut self, id: ModuleId, message: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.ssr_error = Some(message.into());
        }
    }

    /// Remove modules that are no longer reachable.
    ///
    /// A candidate is removed if it has no importers other than itself and is
    /// not an entry. Removal cascades to its own dependencies. Returns the
    /// urls of removed modules, in removal order.
    pub fn prune(&mut self, candidates: impl IntoIterator<Item = ModuleId>) -> Vec<String> {
        let mut queue: Vec<ModuleId> = candidates.into_iter().collect();
        let mut visited = HashSet::new();
        let mut removed = Vec::new();

        while let Some(id) = queue.pop() {
            if !visited.insert(id) {
                continue;
            }
            let prunable = self.nodes.get(&id).is_some_and(is_unreachable);
            if !prunable {
                continue;
            }
            let Some(node) = self.nodes.remove(&id) else {
                continue;
            };

            for dep in &node.imported_modules {
                if let Some(dep_node) = self.nodes.get_mut(dep) {
                    dep_node.importers.remove(&id);
                    if is_unreachable(dep_node) {
                        queue.push(*dep);
                    }
                }
            }
            // Accept lists may still point at the removed node
            for other in self.nodes.values_mut() {
                other.accepted_hmr_deps.remove(&id);
                other.imported_bindings.remove(&id);
            }

            self.url_to_module.retain(|_, v| *v != id);
            self.resolved_to_module.retain(|_, v| *v != id);
            if let Some(file) = &node.file {
                if let Some(ids) = self.file_to_modules.get_mut(file) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.file_to_modules.remove(file);
                    }
                }
            }
            debug!(url = %node.url, "pruned module");
            removed.push(node.url);
        }

        self.debug_assert_consistent();
        removed
    }

    /// Verify edge symmetry and index consistency.
    ///
    /// # Errors
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for node in self.nodes.values() {
            for dep in &node.imported_modules {
                let Some(dep_node) = self.nodes.get(dep) else {
                    return Err(format!("{} imports missing node {dep}", node.url));
                };
                if !dep_node.importers.contains(&node.id) {
                    return Err(format!(
                        "{} imports {} but is not among its importers",
                        node.url, dep_node.url
                    ));
                }
            }
            for importer in &node.importers {
                let Some(importer_node) = self.nodes.get(importer) else {
                    return Err(format!("{} has missing importer {importer}", node.url));
                };
                if !importer_node.imported_modules.contains(&node.id) {
                    return Err(format!(
                        "{} lists importer {} which does not import it",
                        node.url, importer_node.url
                    ));
                }
            }
        }
        for (url, id) in &self.url_to_module {
            if !self.nodes.contains_key(id) {
                return Err(format!("url index points {url} at missing node {id}"));
            }
        }
        Ok(())
    }

    fn debug_assert_consistent(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.check_invariants() {
            panic!("module graph invariant violated: {violation}");
        }
    }
}

fn is_unreachable(node: &ModuleNode) -> bool {
    !node.is_entry && node.importers.iter().all(|i| *i == node.id)
}

/// Remove the `t=` cache-busting parameter from a url's query.
#[must_use]
pub fn strip_timestamp_query(url: &str) -> String {
    let (base, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let Some((path, query)) = base.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && *pair != "t" && !pair.starts_with("t="))
        .collect();
    if kept.is_empty() {
        format!("{path}{hash}")
    } else {
        format!("{path}?{}{hash}", kept.join("&"))
    }
}

/// The `t=` value of a url, if present.
#[must_use]
pub fn timestamp_query(url: &str) -> Option<u64> {
    let query = url.split('#').next()?.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("t="))
        .and_then(|v| v.parse().ok())
}

/// Append `t=<timestamp>` to a url.
#[must_use]
pub fn inject_timestamp_query(url: &str, timestamp: u64) -> String {
    let clean = strip_timestamp_query(url);
    let (base, hash) = match clean.find('#') {
        Some(i) => (&clean[..i], &clean[i..]),
        None => (clean.as_str(), ""),
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}t={timestamp}{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(graph: &mut ModuleGraph, url: &str) -> ModuleId {
        let path = format!("/project{url}");
        let resolved = ResolvedId::new(path.clone(), Some(PathBuf::from(path)));
        graph.resolve_url(url, &resolved)
    }

    fn imports(graph: &mut ModuleGraph, id: ModuleId, deps: &[ModuleId]) -> Vec<ModuleId> {
        graph.update_module_info(
            id,
            ModuleInfoUpdate {
                imported: deps.iter().copied().collect(),
                ..ModuleInfoUpdate::default()
            },
        )
    }

    #[test]
    fn test_resolve_url_is_idempotent() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/src/a.js");
        let again = add(&mut graph, "/src/a.js?t=123");
        assert_eq!(a, again);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get_by_url("/src/a.js?t=999").unwrap().id, a);
    }

    #[test]
    fn test_file_backs_multiple_query_variants() {
        let mut graph = ModuleGraph::new();
        let file = PathBuf::from("/project/src/style.css");
        let plain = graph.resolve_url(
            "/src/style.css",
            &ResolvedId::new("/project/src/style.css", Some(file.clone())),
        );
        let inline = graph.resolve_url(
            "/src/style.css?inline",
            &ResolvedId::new("/project/src/style.css?inline", Some(file.clone())),
        );
        assert_ne!(plain, inline);

        let ids = graph.ensure_entry_from_file(&file);
        assert_eq!(ids, vec![plain, inline]);
        assert_eq!(graph.get(plain).unwrap().module_type, ModuleType::Css);
    }

    #[test]
    fn test_update_module_info_keeps_edges_symmetric() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/a.js");
        let b = add(&mut graph, "/b.js");
        let c = add(&mut graph, "/c.js");

        imports(&mut graph, a, &[b, c]);
        assert!(graph.get(b).unwrap().importers.contains(&a));
        assert!(graph.get(c).unwrap().importers.contains(&a));

        let dropped = imports(&mut graph, a, &[c]);
        assert_eq!(dropped, vec![b]);
        assert!(graph.get(b).unwrap().importers.is_empty());
        graph.check_invariants().unwrap();
    }

    #[test]
    fn test_removing_edge_inside_cycle() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/a.js");
        let b = add(&mut graph, "/b.js");
        graph.mark_entry(a);

        imports(&mut graph, a, &[b]);
        imports(&mut graph, b, &[a]);
        assert!(graph.get(a).unwrap().importers.contains(&b));

        // b stops importing a; a is still an entry so nothing is dropped
        let dropped = imports(&mut graph, b, &[]);
        assert!(dropped.is_empty());
        assert!(graph.get(a).unwrap().importers.is_empty());
        assert_eq!(
            graph.get(b).unwrap().importers.iter().copied().collect::<Vec<_>>(),
            vec![a]
        );
        graph.check_invariants().unwrap();
    }

    #[test]
    fn test_edge_symmetry_under_random_updates() {
        let mut graph = ModuleGraph::new();
        let ids: Vec<ModuleId> = (0..12).map(|i| add(&mut graph, &format!("/m{i}.js"))).collect();

        // Small LCG so the sequence is deterministic
        let mut seed: u64 = 0x2545_f491;
        let mut next = || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (seed >> 33) as usize
        };

        for _ in 0..500 {
            let owner = ids[next() % ids.len()];
            let count = next() % 4;
            let deps: Vec<ModuleId> = (0..count).map(|_| ids[next() % ids.len()]).collect();
            imports(&mut graph, owner, &deps);
            graph.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_invalidate_module_is_idempotent_in_effect() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/a.js");
        let stored = graph.set_transform_result(
            a,
            Arc::new(TransformResult {
                code: "export {}".to_string(),
                map: None,
                imports: Vec::new(),
                dynamic_imports: BTreeSet::new(),
                accepted_deps: BTreeSet::new(),
                epoch: 0,
            }),
        );
        assert!(stored);
        assert!(!graph.get(a).unwrap().is_dirty());

        graph.invalidate_module(a, &mut HashSet::new(), None);
        graph.invalidate_module(a, &mut HashSet::new(), None);

        let node = graph.get(a).unwrap();
        assert_eq!(node.transform_epoch, 2);
        assert!(node.transform_result.is_none());
        assert!(node.is_dirty());
    }

    #[test]
    fn test_invalidate_with_shared_seen_set_runs_once() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/a.js");
        let mut seen = HashSet::new();
        graph.invalidate_module(a, &mut seen, Some(10));
        graph.invalidate_module(a, &mut seen, Some(20));
        let node = graph.get(a).unwrap();
        assert_eq!(node.transform_epoch, 1);
        assert_eq!(node.last_hmr_timestamp, 10);
    }

    #[test]
    fn test_stale_transform_result_is_rejected() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, "/a.js");
        let epoch = graph.epoch_of(a).unwrap();
        graph.invalidate_module(a, &mut HashSet::new(), None);

        let stored = graph.set_transform_result(
            a,
            Arc::new(TransformResult {
                code: String::new(),
                map: None,
                imports: Vec::new(),
                dynamic_imports: BTreeSet::new(),
                accepted_deps: BTreeSet::new(),
                epoch,
            }),
        );
        assert!(!stored);
        assert!(graph.get(a).unwrap().transform_result.is_none());
    }

    #[test]
    fn test_prune_cascades_and_spares_entries() {
        let mut graph = ModuleGraph::new();
        let main = add(&mut graph, "/main.js");
        let a = add(&mut graph, "/a.js");
        let b = add(&mut graph, "/b.js");
        let shared = add(&mut graph, "/shared.js");
        graph.mark_entry(main);

        imports(&mut graph, main, &[a, shared]);
        imports(&mut graph, a, &[b, shared]);
        imports(&mut graph, b, &[b]);

        let dropped = imports(&mut graph, main, &[shared]);
        let removed = graph.prune(dropped);

        assert_eq!(removed, vec!["/a.js".to_string(), "/b.js".to_string()]);
        assert!(graph.get_by_url("/a.js").is_none());
        assert!(graph.get_by_url("/b.js").is_none());
        assert!(graph.ensure_entry_from_file(Path::new("/project/b.js")).is_empty());
        assert_eq!(
            graph.get(shared).unwrap().importers.iter().copied().collect::<Vec<_>>(),
            vec![main]
        );
        graph.check_invariants().unwrap();

        // Entries survive even with no importers
        assert!(graph.prune([main]).is_empty());
    }

    #[test]
    fn test_unlinked_entry_is_prunable_once_unreferenced() {
        let mut graph = ModuleGraph::new();
        let app = add(&mut graph, "/app.js");
        let util = add(&mut graph, "/util.js");
        graph.mark_entry(app);
        imports(&mut graph, app, &[util]);

        let file = PathBuf::from("/project/util.js");
        assert_eq!(graph.on_file_unlink(&file), vec![util]);
        assert!(graph.prune([util]).is_empty());

        let orphaned = imports(&mut graph, app, &[]);
        assert_eq!(graph.prune(orphaned), vec!["/util.js".to_string()]);
        assert!(graph.on_file_unlink(&file).is_empty());
    }

    #[test]
    fn test_file_add_invalidates_known_nodes() {
        let mut graph = ModuleGraph::new();
        let app = add(&mut graph, "/app.js");
        let before = graph.epoch_of(app).unwrap();
        assert_eq!(graph.on_file_add(Path::new("/project/app.js")), vec![app]);
        assert_eq!(graph.epoch_of(app), Some(before + 1));
        assert!(graph.on_file_add(Path::new("/project/new.js")).is_empty());
    }

    #[test]
    fn test_strip_timestamp_query() {
        assert_eq!(strip_timestamp_query("/a.js?t=123"), "/a.js");
        assert_eq!(strip_timestamp_query("/a.js?import&t=1"), "/a.js?import");
        assert_eq!(strip_timestamp_query("/a.js?t=1&raw#x"), "/a.js?raw#x");
        assert_eq!(strip_timestamp_query("/a.js?test=1"), "/a.js?test=1");
        assert_eq!(strip_timestamp_query("/a.js"), "/a.js");
    }

    #[test]
    fn test_timestamp_query_roundtrip_helpers() {
        assert_eq!(timestamp_query("/a.js?t=42"), Some(42));
        assert_eq!(timestamp_query("/a.js?raw"), None);
        assert_eq!(inject_timestamp_query("/a.js", 7), "/a.js?t=7");
        assert_eq!(inject_timestamp_query("/a.js?raw&t=1", 7), "/a.js?raw&t=7");
    }
}
