use std::path::PathBuf;
use thiserror::Error;

use crate::runner::StackFrame;

/// Result alias for fallible core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error type for hotwire operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// A specifier that could not be mapped to a module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot resolve '{specifier}'{}", .importer.as_ref().map(|i| format!(" imported from {i}")).unwrap_or_default())]
pub struct ResolveError {
    pub specifier: String,
    pub importer: Option<String>,
}

impl ResolveError {
    #[must_use]
    pub fn new(specifier: impl Into<String>, importer: Option<&str>) -> Self {
        Self {
            specifier: specifier.into(),
            importer: importer.map(str::to_string),
        }
    }
}

/// Failure to produce a transformed module.
///
/// `Clone` because one in-flight transform result is handed to every
/// concurrent requester.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The requested url itself does not resolve (404).
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The external transformer rejected the module.
    #[error("failed to transform {id}: {message}")]
    Failed {
        id: String,
        message: String,
        plugin: Option<String>,
    },

    /// The module kept being invalidated while its transform ran.
    #[error("{id} was invalidated {attempts} times while transforming")]
    Invalidated { id: String, attempts: u32 },
}

impl TransformError {
    #[must_use]
    pub fn failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            id: id.into(),
            message: message.into(),
            plugin: None,
        }
    }

    /// True if this is a 404-style failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Resolve(_))
    }
}

/// Dependency optimizer failures. Never fatal to the server.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("dependency bundling failed: {0}")]
    Bundle(String),

    #[error("dependency scan failed: {0}")]
    Scan(String),

    #[error("optimizer I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid optimizer metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("optimization superseded by a newer run")]
    Cancelled,

    #[error("dependencies {first} and {second} both map to {file}")]
    FileCollision {
        file: String,
        first: String,
        second: String,
    },
}

impl OptimizerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Module runner failures.
///
/// `Clone` because a module's in-flight evaluation is shared by every
/// importer awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("{message}{}", format_stack(.stack))]
    Evaluation {
        id: String,
        message: String,
        stack: Vec<StackFrame>,
    },

    #[error("Cannot access '{name}' before initialization")]
    Uninitialized { name: String },

    #[error("Assignment to constant variable '{name}'")]
    ConstAssignment { name: String },

    #[error("module runner has been closed")]
    Closed,
}

fn format_stack(stack: &[StackFrame]) -> String {
    stack.iter().map(|frame| format!("\n    at {frame}")).collect()
}

/// Transport failures. Only ever logged: the channel swallows them.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}
