//! Bare-import discovery.
//!
//! Walks relative imports from the entry modules through the external
//! transformer and collects every bare specifier it meets, static or dynamic.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use hotwire_util::fs::read_to_string_lossy;
use tracing::{debug, warn};

use crate::config::OptimizeDepsConfig;
use crate::graph::ResolvedId;
use crate::transform::Transformer;

/// Default entry candidates when neither `optimizeDeps.entries` nor an
/// `index.html` names any.
const DEFAULT_ENTRIES: &[&str] = &[
    "src/main.ts",
    "src/main.tsx",
    "src/main.js",
    "src/main.jsx",
    "src/index.ts",
    "src/index.tsx",
    "src/index.js",
    "src/index.jsx",
];

/// Check if a specifier names a package rather than a file.
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !specifier.starts_with('\0')
        && !specifier.starts_with('#')
        && !specifier.starts_with("node:")
        && !specifier.starts_with("data:")
        && !specifier.starts_with("virtual:")
        && !specifier.contains("://")
}

/// `react-dom/client` -> `react-dom`, `@scope/pkg/sub` -> `@scope/pkg`.
#[must_use]
pub fn package_name_from_specifier(specifier: &str) -> &str {
    let mut slashes = specifier.match_indices('/').map(|(i, _)| i);
    let cut = if specifier.starts_with('@') {
        slashes.nth(1)
    } else {
        slashes.next()
    };
    cut.map_or(specifier, |i| &specifier[..i])
}

/// File stem of a bundled dependency: `@scope/pkg/sub` -> `@scope__pkg__sub`.
///
/// `_` only ever starts an escape (`__` for `/`, `_u` for a literal `_`,
/// `_xHH` for characters unsafe in file names), so distinct specifiers
/// never share a file.
#[must_use]
pub fn flatten_id(specifier: &str) -> String {
    let mut out = String::with_capacity(specifier.len());
    for c in specifier.chars() {
        match c {
            '/' => out.push_str("__"),
            '_' => out.push_str("_u"),
            '\\' | ':' | '?' | '#' | '%' => out.push_str(&format!("_x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

/// Whether `specifier` is listed in `exclude`, directly or by package name.
#[must_use]
pub fn is_excluded(config: &OptimizeDepsConfig, specifier: &str) -> bool {
    let package = package_name_from_specifier(specifier);
    config
        .exclude
        .iter()
        .any(|excluded| excluded == specifier || excluded == package)
}

/// Entry urls to scan from: `optimizeDeps.entries`, else the module scripts
/// of `index.html`, else the first conventional `src/main.*` that exists.
#[must_use]
pub fn default_entries(root: &Path, config: &OptimizeDepsConfig) -> Vec<String> {
    if !config.entries.is_empty() {
        return config.entries.iter().map(|e| to_root_url(e)).collect();
    }
    if let Ok(html) = read_to_string_lossy(&root.join("index.html")) {
        let scripts = module_scripts(&html);
        if !scripts.is_empty() {
            return scripts;
        }
    }
    DEFAULT_ENTRIES
        .iter()
        .find(|candidate| root.join(candidate).is_file())
        .map(|candidate| vec![to_root_url(candidate)])
        .unwrap_or_default()
}

fn to_root_url(path: &str) -> String {
    format!("/{}", path.trim_start_matches("./").trim_start_matches('/'))
}

/// `src` attributes of `<script type="module">` tags.
fn module_scripts(html: &str) -> Vec<String> {
    let mut scripts = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find("<script") {
        rest = &rest[start + "<script".len()..];
        let Some(end) = rest.find('>') else {
            break;
        };
        let tag = &rest[..end];
        rest = &rest[end..];
        if !tag.contains("type=\"module\"") && !tag.contains("type='module'") {
            continue;
        }
        if let Some(src) = attribute(tag, "src") {
            if !src.contains("://") {
                scripts.push(to_root_url(src));
            }
        }
    }
    scripts
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let at = tag.find(&format!("{name}="))? + name.len() + 1;
    let value = &tag[at..];
    let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &value[1..];
    value.find(quote).map(|end| &value[..end])
}

/// Walk from `entries` and collect bare specifiers.
///
/// Modules that fail to resolve or transform are skipped with a warning;
/// a partial scan still yields a useful dependency set.
pub async fn scan_imports(transformer: &dyn Transformer, entries: &[String]) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: Vec<ResolvedId> = Vec::new();

    for entry in entries {
        match transformer.resolve_id(entry, None).await {
            Ok(Some(resolved)) if !resolved.external => queue.push(resolved),
            Ok(_) => warn!(entry = %entry, "scan entry could not be resolved"),
            Err(e) => warn!(entry = %entry, error = %e, "scan entry could not be resolved"),
        }
    }

    while let Some(module) = queue.pop() {
        if !visited.insert(module.id.clone()) {
            continue;
        }
        let output = match transformer.transform(&module).await {
            Ok(output) => output,
            Err(e) => {
                warn!(module = %module.id, error = %e, "skipping module during dependency scan");
                continue;
            }
        };

        for import in &output.imports {
            if is_bare_specifier(&import.specifier) {
                deps.insert(import.specifier.clone());
                continue;
            }
            match transformer.resolve_id(&import.specifier, Some(&module.id)).await {
                Ok(Some(resolved)) if !resolved.external => {
                    if !visited.contains(&resolved.id) {
                        queue.push(resolved);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(specifier = %import.specifier, error = %e, "unresolved import during scan"),
            }
        }
    }

    debug!(modules = visited.len(), deps = deps.len(), "dependency scan complete");
    deps
}

/// Apply `include`/`exclude` to a scanned set.
#[must_use]
pub fn apply_filters(config: &OptimizeDepsConfig, scanned: BTreeSet<String>) -> BTreeSet<String> {
    scanned
        .into_iter()
        .chain(config.include.iter().cloned())
        .filter(|spec| !is_excluded(config, spec))
        .collect()
}
