use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hotwire_util::fs::atomic_write;
use hotwire_util::hash::{blake3_file, short_hash};
use serde::{Deserialize, Serialize};

use crate::config::DevConfig;
use crate::error::OptimizerError;

/// Name of the metadata file inside the deps directory.
pub const METADATA_FILE: &str = "_metadata.json";

/// Lockfiles whose content feeds the optimizer hash, in lookup order.
pub const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    "bun.lock",
];

/// Persisted description of one optimized dependency set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerMetadata {
    /// Hash of the inputs that produced this set.
    pub hash: String,
    /// Version appended to `/@deps/` urls (`?v=`).
    pub browser_hash: String,
    #[serde(default)]
    pub optimized: BTreeMap<String, OptimizedDepInfo>,
    #[serde(default)]
    pub discovered: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedDepInfo {
    /// File name relative to the deps directory.
    pub file: String,
    pub needs_interop: bool,
    #[serde(default)]
    pub file_hash: String,
}

impl OptimizerMetadata {
    /// Read `<dir>/_metadata.json`. A missing file is `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(dir: &Path) -> Result<Option<Self>, OptimizerError> {
        let path = dir.join(METADATA_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OptimizerError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| OptimizerError::Metadata { path, source })
    }

    /// Write `<dir>/_metadata.json` atomically.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write(&self, dir: &Path) -> Result<(), OptimizerError> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|source| OptimizerError::Metadata {
                path: path.clone(),
                source,
            })?;
        atomic_write(&path, &json).map_err(|e| OptimizerError::io(path, e))
    }

    /// The specifiers this set was built from.
    #[must_use]
    pub fn discovered_set(&self) -> BTreeSet<String> {
        self.discovered
            .iter()
            .filter(|(_, known)| **known)
            .map(|(spec, _)| spec.clone())
            .collect()
    }
}

/// Metadata plus the bundle text, published as one unit.
#[derive(Debug)]
pub struct OptimizerSnapshot {
    pub metadata: Arc<OptimizerMetadata>,
    pub dir: PathBuf,
    code: HashMap<String, Arc<str>>,
}

impl OptimizerSnapshot {
    #[must_use]
    pub fn new(metadata: OptimizerMetadata, dir: PathBuf, code: HashMap<String, Arc<str>>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            dir,
            code,
        }
    }

    /// Load the bundle files referenced by `metadata` from `dir`.
    ///
    /// # Errors
    /// Returns an error if any referenced file is missing.
    pub fn load(metadata: OptimizerMetadata, dir: PathBuf) -> Result<Self, OptimizerError> {
        let mut code = HashMap::with_capacity(metadata.optimized.len());
        for info in metadata.optimized.values() {
            let path = dir.join(&info.file);
            let text = std::fs::read_to_string(&path).map_err(|e| OptimizerError::io(path, e))?;
            code.insert(info.file.clone(), Arc::from(text));
        }
        Ok(Self::new(metadata, dir, code))
    }

    #[must_use]
    pub fn code(&self, file: &str) -> Option<Arc<str>> {
        self.code.get(file).cloned()
    }

    /// Specifier whose bundle is `file`.
    #[must_use]
    pub fn specifier_for_file(&self, file: &str) -> Option<&str> {
        self.metadata
            .optimized
            .iter()
            .find(|(_, info)| info.file == file)
            .map(|(spec, _)| spec.as_str())
    }
}

/// Fingerprint of the first lockfile found in `root`, as `name:hash`.
#[must_use]
pub fn lockfile_fingerprint(root: &Path) -> Option<String> {
    LOCKFILES.iter().find_map(|name| {
        let path = root.join(name);
        blake3_file(&path).ok().map(|hash| format!("{name}:{hash}"))
    })
}

/// Hash over everything that changes the optimized output.
#[must_use]
pub fn compute_hash(
    config: &DevConfig,
    discovered: &BTreeSet<String>,
    lockfile: Option<&str>,
) -> String {
    let deps = discovered.iter().cloned().collect::<Vec<_>>().join("\n");
    let mut include = config.optimize_deps.include.clone();
    include.sort();
    let mut exclude = config.optimize_deps.exclude.clone();
    exclude.sort();
    let define = config
        .define
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");

    short_hash([
        deps.as_str(),
        &include.join("\n"),
        &exclude.join("\n"),
        &define,
        config.mode.as_str(),
        lockfile.unwrap_or(""),
    ])
}

/// Browser hash: changes whenever any bundle's content changes.
#[must_use]
pub fn browser_hash(hash: &str, optimized: &BTreeMap<String, OptimizedDepInfo>) -> String {
    short_hash(
        std::iter::once(hash).chain(optimized.values().map(|info| info.file_hash.as_str())),
    )
}
