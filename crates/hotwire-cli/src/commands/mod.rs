//! Subcommands.

pub mod dev;
pub mod optimize;

mod client;
mod project;
mod watch;
mod ws;

use std::path::PathBuf;

use hotwire_core::{load_config, DevConfig};
use miette::{IntoDiagnostic, Result};
use tracing::info;

/// Arguments shared by every command that opens a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectArgs {
    pub root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub force: bool,
}

impl ProjectArgs {
    /// Resolve the root and load its config, applying `--force`.
    pub fn load(&self) -> Result<DevConfig> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().into_diagnostic()?,
        };
        let root = root.canonicalize().into_diagnostic()?;

        let mut config = match load_config(&root, self.config.as_deref()).into_diagnostic()? {
            Some((path, config)) => {
                info!(path = %path.display(), "loaded config");
                config
            }
            None => DevConfig::for_root(&root),
        };
        // Config roots may be relative or spelled through symlinks
        config.root = config.root.canonicalize().unwrap_or(config.root);
        if self.force {
            config.optimize_deps.force = true;
        }
        Ok(config)
    }
}
