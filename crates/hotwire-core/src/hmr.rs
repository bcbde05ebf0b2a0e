//! Hot update propagation.
//!
//! Given changed files (or a module a client invalidated), walk up the
//! importer edges of the [`ModuleGraph`] until every path ends at an
//! accepting boundary. A path that reaches a module without importers, or
//! closes an import cycle, cannot be hot-updated and turns the whole batch
//! into one `full-reload`.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hotwire_proto::{HotPayload, Update, UpdateKind};
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::graph::{ModuleGraph, ModuleId, ModuleNode, ModuleType};
use crate::transform::Transformer;
use crate::transport::HotBroadcaster;

/// Strictly increasing millisecond timestamps for update payloads.
#[derive(Debug, Default)]
pub struct HmrClock {
    last: AtomicU64,
}

impl HmrClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock milliseconds, bumped past the previous value if needed.
    pub fn next(&self) -> u64 {
        let now = now_ms();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A module that accepts an update, and the module whose update it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Boundary {
    pub boundary: ModuleId,
    pub accepted_via: ModuleId,
}

/// Why propagation gave up on hot updating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadEnd {
    /// Reached a module nothing imports without finding an acceptor.
    NoImporters { url: String },
    /// An importer was already on the current path.
    Cycle { url: String },
}

/// Result of handling one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmrOutcome {
    /// Nothing in the graph depends on the change.
    NoOp,
    Update(Vec<Update>),
    FullReload {
        path: Option<String>,
        triggered_by: Option<String>,
    },
}

impl HmrOutcome {
    #[must_use]
    pub fn into_payload(self) -> Option<HotPayload> {
        match self {
            Self::NoOp => None,
            Self::Update(updates) => Some(HotPayload::Update { updates }),
            Self::FullReload { path, triggered_by } => {
                Some(HotPayload::FullReload { path, triggered_by })
            }
        }
    }

    #[must_use]
    pub fn is_full_reload(&self) -> bool {
        matches!(self, Self::FullReload { .. })
    }
}

/// Walk from `start` up to its accepting boundaries.
///
/// Boundaries are appended to `boundaries`, every visited module to
/// `traversed`. The walk is a depth-first search over importers: a module
/// stays on the chain until all its importers are explored, and an importer
/// still on the chain closes a cycle. Modules explored to the end are not
/// walked again. Whether the walk dead-ends does not depend on importer
/// order; when both kinds of dead end are reachable, the first one met is
/// reported.
///
/// # Errors
/// Returns the dead end that forces a full reload.
pub fn propagate_update(
    graph: &ModuleGraph,
    start: ModuleId,
    boundaries: &mut Vec<Boundary>,
    traversed: &mut BTreeSet<ModuleId>,
) -> Result<(), DeadEnd> {
    let mut on_chain = HashSet::new();
    let mut done = HashSet::new();
    let mut frames: Vec<(ModuleId, Vec<ModuleId>)> = Vec::new();

    if let Some(ascend) = enter(graph, start, boundaries, traversed)? {
        on_chain.insert(start);
        frames.push((start, ascend));
    }

    while let Some((id, pending)) = frames.last_mut() {
        let id = *id;
        let Some(importer_id) = pending.pop() else {
            on_chain.remove(&id);
            done.insert(id);
            frames.pop();
            continue;
        };
        if on_chain.contains(&importer_id) {
            let url = graph.get(importer_id).map(|n| n.url.clone()).unwrap_or_default();
            return Err(DeadEnd::Cycle { url });
        }
        if done.contains(&importer_id) {
            continue;
        }
        match enter(graph, importer_id, boundaries, traversed)? {
            Some(ascend) => {
                on_chain.insert(importer_id);
                frames.push((importer_id, ascend));
            }
            None => {
                done.insert(importer_id);
            }
        }
    }
    Ok(())
}

/// Visit one module: record the boundaries it settles and return the
/// importers the walk must continue through, or `None` if it stops here.
fn enter(
    graph: &ModuleGraph,
    id: ModuleId,
    boundaries: &mut Vec<Boundary>,
    traversed: &mut BTreeSet<ModuleId>,
) -> Result<Option<Vec<ModuleId>>, DeadEnd> {
    let Some(node) = graph.get(id) else {
        return Ok(None);
    };
    traversed.insert(id);

    if node.is_self_accepting {
        trace!(url = %node.url, "self-accepting boundary");
        boundaries.push(Boundary {
            boundary: id,
            accepted_via: id,
        });
        return Ok(None);
    }
    if node.importers.is_empty() {
        return Err(DeadEnd::NoImporters {
            url: node.url.clone(),
        });
    }

    let mut ascend = Vec::new();
    let mut accepted_by_exports = false;
    for &importer_id in &node.importers {
        let Some(importer) = graph.get(importer_id) else {
            continue;
        };
        if importer.accepted_hmr_deps.contains(&id) {
            trace!(url = %node.url, importer = %importer.url, "accepted by importer");
            traversed.insert(importer_id);
            boundaries.push(Boundary {
                boundary: importer_id,
                accepted_via: id,
            });
            continue;
        }
        if accepts_imported_exports(node, importer) {
            accepted_by_exports = true;
            continue;
        }
        ascend.push(importer_id);
    }
    if accepted_by_exports {
        boundaries.push(Boundary {
            boundary: id,
            accepted_via: id,
        });
    }
    // Popped from the back: walk importers in ascending id order
    ascend.reverse();
    Ok(Some(ascend))
}

/// The importer only uses exports that `node` accepts itself.
fn accepts_imported_exports(node: &ModuleNode, importer: &ModuleNode) -> bool {
    let Some(accepted) = &node.accepted_hmr_exports else {
        return false;
    };
    importer
        .imported_bindings
        .get(&node.id)
        .is_some_and(|names| !names.contains("*") && names.is_subset(accepted))
}

pub struct HmrEngine {
    root: PathBuf,
    enabled: bool,
    graph: Arc<RwLock<ModuleGraph>>,
    transformer: Arc<dyn Transformer>,
    hot: Arc<HotBroadcaster>,
    clock: HmrClock,
}

impl HmrEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        enabled: bool,
        graph: Arc<RwLock<ModuleGraph>>,
        transformer: Arc<dyn Transformer>,
        hot: Arc<HotBroadcaster>,
    ) -> Self {
        Self {
            root: root.into(),
            enabled,
            graph,
            transformer,
            hot,
            clock: HmrClock::new(),
        }
    }

    /// Propagate a batch of changed (or removed) files and broadcast the
    /// outcome.
    pub fn handle_file_change(&self, files: &[PathBuf]) -> HmrOutcome {
        let mut starts = BTreeSet::new();
        let mut page_reload = None;

        for file in files {
            let modules = self.graph.read().ensure_entry_from_file(file);
            let modules = self.transformer.handle_hot_update(file, modules);
            if modules.is_empty() {
                if is_html(file) && page_reload.is_none() {
                    page_reload = Some(self.url_for_file(file));
                } else {
                    trace!(file = %file.display(), "changed file is not in the module graph");
                }
                continue;
            }
            starts.extend(modules);
        }

        let triggered_by = files.first().map(|f| self.url_for_file(f));
        let outcome = if starts.is_empty() {
            match page_reload {
                Some(path) => HmrOutcome::FullReload {
                    path: Some(path),
                    triggered_by: None,
                },
                None => HmrOutcome::NoOp,
            }
        } else {
            let outcome = self.update_modules(&starts, triggered_by);
            match (outcome, page_reload) {
                (HmrOutcome::Update(_), Some(path)) => HmrOutcome::FullReload {
                    path: Some(path),
                    triggered_by: None,
                },
                (outcome, _) => outcome,
            }
        };

        self.broadcast(&outcome);
        outcome
    }

    /// Handle `invalidate()` from a client: the module cannot accept its own
    /// update, so propagate from its importers.
    pub fn invalidate_from_client(&self, url: &str, message: Option<&str>) -> HmrOutcome {
        let (id, importers) = {
            let graph = self.graph.read();
            let Some(node) = graph.get_by_url(url) else {
                debug!(url, "invalidate for a module not in the graph");
                return HmrOutcome::NoOp;
            };
            (node.id, node.importers.clone())
        };
        match message {
            Some(message) => info!(url, message, "module invalidated by client"),
            None => info!(url, "module invalidated by client"),
        }

        self.graph
            .write()
            .invalidate_module(id, &mut HashSet::new(), Some(self.clock.next()));

        let outcome = if importers.is_empty() {
            HmrOutcome::FullReload {
                path: None,
                triggered_by: Some(crate::graph::strip_timestamp_query(url)),
            }
        } else {
            self.update_modules(&importers, Some(crate::graph::strip_timestamp_query(url)))
        };
        self.broadcast(&outcome);
        outcome
    }

    /// Run propagation for every start module and build the batch outcome.
    fn update_modules(&self, starts: &BTreeSet<ModuleId>, triggered_by: Option<String>) -> HmrOutcome {
        let timestamp = self.clock.next();
        let mut graph = self.graph.write();

        let mut boundaries = Vec::new();
        let mut traversed = BTreeSet::new();
        let mut dead_end = None;
        for &start in starts {
            traversed.insert(start);
            if !self.enabled {
                dead_end.get_or_insert(DeadEnd::NoImporters {
                    url: graph.url_of(start).unwrap_or_default().to_string(),
                });
                continue;
            }
            if let Err(reason) = propagate_update(&graph, start, &mut boundaries, &mut traversed) {
                dead_end.get_or_insert(reason);
            }
        }

        let mut seen = HashSet::new();
        for &id in &traversed {
            graph.invalidate_module(id, &mut seen, Some(timestamp));
        }

        if let Some(reason) = dead_end {
            info!(?reason, "hot update not possible, reloading");
            return HmrOutcome::FullReload {
                path: Some("*".to_string()),
                triggered_by,
            };
        }

        let mut unique = BTreeSet::new();
        let updates: Vec<Update> = boundaries
            .into_iter()
            .filter(|b| unique.insert(*b))
            .filter_map(|b| {
                let boundary = graph.get(b.boundary)?;
                let accepted = graph.get(b.accepted_via)?;
                Some(Update {
                    kind: match boundary.module_type {
                        ModuleType::Css => UpdateKind::CssUpdate,
                        ModuleType::Js => UpdateKind::JsUpdate,
                    },
                    path: boundary.url.clone(),
                    accepted_path: accepted.url.clone(),
                    timestamp,
                })
            })
            .collect();

        if updates.is_empty() {
            return HmrOutcome::FullReload {
                path: Some("*".to_string()),
                triggered_by,
            };
        }
        for update in &updates {
            info!(path = %update.path, accepted = %update.accepted_path, "hmr update");
        }
        HmrOutcome::Update(updates)
    }

    fn broadcast(&self, outcome: &HmrOutcome) {
        if let Some(payload) = outcome.clone().into_payload() {
            self.hot.send(payload);
        }
    }

    fn url_for_file(&self, file: &Path) -> String {
        match file.strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
            Err(_) => file.to_string_lossy().into_owned(),
        }
    }
}

fn is_html(file: &Path) -> bool {
    file.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("html"))
}
