#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Core of the hotwire dev server.
//!
//! A [`DevSession`] ties together the module graph, the on-demand transform
//! cache, hot update propagation and dependency pre-bundling. Module
//! runners evaluate server-transformed code and apply hot updates over any
//! [`transport::TransportChannel`].

pub mod analysis;
pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod optimizer;
pub mod runner;
pub mod session;
pub mod transform;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{load_config, DevConfig};
pub use error::{
    ChannelError, Error, OptimizerError, ResolveError, Result, RunnerError, TransformError,
};
pub use graph::{ModuleGraph, ModuleId, ModuleNode, ResolvedId, TransformResult};
pub use hmr::{HmrEngine, HmrOutcome};
pub use optimizer::{BundleRequest, BundledDep, DepBundler, DependencyOptimizer, OptimizerMetadata};
pub use runner::{
    ChannelFetcher, ModuleContext, ModuleEvaluator, ModuleFetcher, ModuleNamespace, ModuleRunner,
    SessionFetcher,
};
pub use session::{DevSession, FileEventKind};
pub use transform::{TransformCache, TransformOutput, Transformer};

/// Hotwire version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
