//! Dev server configuration.
//!
//! Loaded from `hotwire.config.json` in the project root (camelCase keys),
//! then overridden by CLI flags. Every field has a default so an empty
//! object is a valid config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file names searched in the project root, in priority order.
pub const CONFIG_FILES: &[&str] = &["hotwire.config.json", ".hotwirerc.json"];

/// Default cache directory, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = "node_modules/.hotwire";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevConfig {
    /// Project root. Relative paths are resolved against the directory
    /// the config was loaded from.
    pub root: PathBuf,
    /// Where optimizer output lives. Defaults to [`DEFAULT_CACHE_DIR`].
    pub cache_dir: Option<PathBuf>,
    pub mode: String,
    /// Compile-time replacements. Part of the optimizer hash.
    pub define: BTreeMap<String, String>,
    pub server: ServerConfig,
    pub optimize_deps: OptimizeDepsConfig,
    pub hmr: HmrConfig,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            cache_dir: None,
            mode: "development".to_string(),
            define: BTreeMap::new(),
            server: ServerConfig::default(),
            optimize_deps: OptimizeDepsConfig::default(),
            hmr: HmrConfig::default(),
        }
    }
}

impl DevConfig {
    /// Config rooted at `root` with everything else defaulted.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Absolute cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.join(DEFAULT_CACHE_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizeDepsConfig {
    /// Always optimized, even if the scan never sees them.
    pub include: Vec<String>,
    /// Never optimized, even if the scan finds them.
    pub exclude: Vec<String>,
    /// Scan entry points, relative to the root. Defaults to `index.html`'s
    /// scripts or `src/main.*` when empty.
    pub entries: Vec<String>,
    /// Window for coalescing newly discovered dependencies.
    pub debounce_ms: u64,
    /// Ignore cached metadata and rebuild.
    pub force: bool,
    pub disabled: bool,
}

impl Default for OptimizeDepsConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            entries: Vec::new(),
            debounce_ms: 100,
            force: false,
            disabled: false,
        }
    }
}

impl OptimizeDepsConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HmrConfig {
    pub enabled: bool,
}

impl Default for HmrConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Find the config file in `root`, if any.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Load configuration for the project in `root`.
///
/// If `config_path` is `Some`, that file must exist. Otherwise the root is
/// searched and `Ok(None)` means no config file was found.
pub fn load_config(root: &Path, config_path: Option<&Path>) -> Result<Option<(PathBuf, DevConfig)>> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if !abs.exists() {
                return Err(Error::ConfigRead {
                    path: abs,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
                });
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let mut config: DevConfig =
        serde_json::from_str(&source).map_err(|source| Error::ConfigParse {
            path: path.clone(),
            source,
        })?;

    if config.root.is_relative() {
        let base = path.parent().unwrap_or(root);
        config.root = base.join(&config.root);
    }

    Ok(Some((path, config)))
}
