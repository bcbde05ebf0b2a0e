//! `hotwire optimize` command implementation.
//!
//! Runs the dependency optimizer once, without starting a server, and
//! reports what ended up in the cache.

use std::sync::Arc;

use hotwire_core::optimizer::DepBundler;
use hotwire_core::{DevSession, OptimizerMetadata, Transformer};
use miette::{miette, Result};
use serde::Serialize;

use super::project::{CopyBundler, FsTransformer};
use super::ProjectArgs;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeReport {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    browser_hash: Option<String>,
    cache_dir: String,
    deps: Vec<DepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepReport {
    specifier: String,
    file: String,
    needs_interop: bool,
}

impl OptimizeReport {
    fn from_metadata(cache_dir: String, metadata: &OptimizerMetadata) -> Self {
        Self {
            ok: true,
            hash: Some(metadata.hash.clone()),
            browser_hash: Some(metadata.browser_hash.clone()),
            cache_dir,
            deps: metadata
                .optimized
                .iter()
                .map(|(specifier, info)| DepReport {
                    specifier: specifier.clone(),
                    file: info.file.clone(),
                    needs_interop: info.needs_interop,
                })
                .collect(),
            error: None,
        }
    }

    fn failed(cache_dir: String, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            hash: None,
            browser_hash: None,
            cache_dir,
            deps: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Optimize the project's dependencies and print the result.
pub async fn run(project: ProjectArgs, json: bool) -> Result<()> {
    let config = project.load()?;
    let cache_dir = config.cache_dir().display().to_string();

    if config.optimize_deps.disabled {
        let report = OptimizeReport::failed(cache_dir, "dependency optimization is disabled");
        return finish(&report, json);
    }

    let transformer = Arc::new(FsTransformer::new(&config.root));
    let bundler: Arc<dyn DepBundler> = Arc::new(CopyBundler::new(Arc::clone(&transformer)));
    let session = DevSession::new(config, transformer as Arc<dyn Transformer>, Some(bundler));
    let metadata = session.start().await;
    session.close();

    let report = match metadata {
        Some(metadata) => OptimizeReport::from_metadata(cache_dir, &metadata),
        None => OptimizeReport::failed(cache_dir, "dependency optimization failed, run with -v for details"),
    };
    finish(&report, json)
}

fn finish(report: &OptimizeReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(report).map_err(|e| miette!("{e}"))?;
        println!("{out}");
        if !report.ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(error) = &report.error {
        return Err(miette!("{error}"));
    }
    println!(
        "Optimized {} dependencies into {}",
        report.deps.len(),
        report.cache_dir
    );
    for dep in &report.deps {
        let interop = if dep.needs_interop { " (interop)" } else { "" };
        println!("  {} -> {}{interop}", dep.specifier, dep.file);
    }
    if let Some(hash) = &report.hash {
        println!("hash: {hash}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotwire_core::optimizer::OptimizedDepInfo;
    use std::collections::BTreeMap;

    #[test]
    fn test_report_json_shape() {
        let metadata = OptimizerMetadata {
            hash: "abc".to_string(),
            browser_hash: "def".to_string(),
            optimized: BTreeMap::from([(
                "lodash".to_string(),
                OptimizedDepInfo {
                    file: "lodash.js".to_string(),
                    needs_interop: true,
                    file_hash: String::new(),
                },
            )]),
            discovered: BTreeMap::new(),
        };
        let report = OptimizeReport::from_metadata("/app/.hotwire".to_string(), &metadata);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["browserHash"], "def");
        assert_eq!(value["cacheDir"], "/app/.hotwire");
        assert_eq!(value["deps"][0]["needsInterop"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failed_report_keeps_error() {
        let report = OptimizeReport::failed("/tmp/cache".to_string(), "boom");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "boom");
        assert!(value.get("hash").is_none());
    }
}
