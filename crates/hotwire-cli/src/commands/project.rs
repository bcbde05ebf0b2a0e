//! File-system transformer and copy bundler used by the CLI.
//!
//! Both are deliberately small: sources are served as written (no
//! transpilation), CSS and JSON are wrapped as ES modules, and the bundler
//! copies each package's entry file instead of bundling its dependencies.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hotwire_core::optimizer::{is_bare_specifier, package_name_from_specifier, BundleRequest, BundledDep, DepBundler};
use hotwire_core::{OptimizerError, ResolvedId, TransformError, TransformOutput, Transformer};
use tracing::{debug, warn};

/// Extensions tried, in order, for extension-less specifiers.
const EXTENSIONS: &[&str] = &["js", "mjs", "jsx", "ts", "tsx", "json", "css"];

pub struct FsTransformer {
    root: PathBuf,
}

impl FsTransformer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Entry file of an installed package, or a file inside it.
    pub fn resolve_package(&self, specifier: &str) -> Option<PathBuf> {
        let name = package_name_from_specifier(specifier);
        let dir = self.root.join("node_modules").join(name);
        let subpath = specifier[name.len()..].trim_start_matches('/');
        if !subpath.is_empty() {
            return probe(&dir.join(subpath));
        }
        let entry = package_entry(&dir).unwrap_or_else(|| "index.js".to_string());
        probe(&dir.join(entry))
    }

    fn resolve_path(&self, specifier: &str, importer: Option<&str>) -> Option<PathBuf> {
        if specifier.split('/').any(|part| part == "..") && specifier.starts_with('/') {
            return None;
        }
        let base = if let Some(url) = specifier.strip_prefix('/') {
            self.root.join(url)
        } else if specifier.starts_with('.') {
            Path::new(importer?).parent()?.join(specifier)
        } else {
            return self.resolve_package(specifier);
        };
        probe(&base)
    }
}

/// `module`, then `main`, from a package's `package.json`.
fn package_entry(dir: &Path) -> Option<String> {
    let manifest = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;
    ["module", "main"]
        .iter()
        .find_map(|field| manifest.get(field)?.as_str().map(str::to_string))
}

fn probe(base: &Path) -> Option<PathBuf> {
    let mut candidates = vec![base.to_path_buf()];
    candidates.extend(
        EXTENSIONS
            .iter()
            .map(|ext| PathBuf::from(format!("{}.{ext}", base.display()))),
    );
    candidates.push(base.join("index.js"));
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .and_then(|found| found.canonicalize().ok())
}

fn css_module(id: &str, css: &str) -> TransformOutput {
    let id = serde_json::Value::from(id);
    let css = serde_json::Value::from(css);
    let code = format!(
        "const id = {id};\n\
         const css = {css};\n\
         document.querySelectorAll(`style[data-hotwire-id=\"${{id}}\"]`).forEach((el) => el.remove());\n\
         const style = document.createElement('style');\n\
         style.setAttribute('data-hotwire-id', id);\n\
         style.textContent = css;\n\
         document.head.appendChild(style);\n\
         export default css;\n"
    );
    TransformOutput {
        code,
        self_accepting: true,
        ..TransformOutput::default()
    }
}

#[async_trait]
impl Transformer for FsTransformer {
    async fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolvedId>, TransformError> {
        let specifier = specifier.split(['?', '#']).next().unwrap_or(specifier);
        match self.resolve_path(specifier, importer) {
            Some(path) => Ok(Some(ResolvedId::new(path.to_string_lossy().into_owned(), Some(path)))),
            None if is_bare_specifier(specifier) => {
                debug!(specifier, "package not installed, leaving import as is");
                Ok(Some(ResolvedId::external(specifier)))
            }
            None => Ok(None),
        }
    }

    async fn transform(&self, module: &ResolvedId) -> Result<TransformOutput, TransformError> {
        let Some(file) = &module.file else {
            return Err(TransformError::failed(&module.id, "module has no file on disk"));
        };
        let source = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| TransformError::failed(&module.id, e.to_string()))?;

        match file.extension().and_then(OsStr::to_str) {
            Some("css") => Ok(css_module(&module.id, &source)),
            Some("json") => Ok(TransformOutput {
                code: format!("export default {};\n", source.trim()),
                ..TransformOutput::default()
            }),
            _ => TransformOutput::analyze(source, None)
                .map_err(|e| TransformError::failed(&module.id, e.to_string())),
        }
    }
}

/// Bundles each dependency by copying its entry file.
///
/// CommonJS entries get a `module.exports` shim and are flagged as needing
/// interop.
pub struct CopyBundler {
    resolver: Arc<FsTransformer>,
}

impl CopyBundler {
    pub fn new(resolver: Arc<FsTransformer>) -> Self {
        Self { resolver }
    }
}

fn looks_like_commonjs(code: &str) -> bool {
    (code.contains("module.exports") || code.contains("exports."))
        && !code.lines().any(|line| line.trim_start().starts_with("export "))
}

fn commonjs_shim(code: &str) -> String {
    format!(
        "const module = {{ exports: {{}} }};\n\
         const exports = module.exports;\n\
         {code}\n\
         export default module.exports;\n"
    )
}

#[async_trait]
impl DepBundler for CopyBundler {
    async fn bundle(&self, request: BundleRequest) -> Result<BTreeMap<String, BundledDep>, OptimizerError> {
        let mut outputs = BTreeMap::new();
        for specifier in request.specifiers {
            let Some(entry) = self.resolver.resolve_package(&specifier) else {
                warn!(specifier = %specifier, "dependency not installed, serving it unoptimized");
                continue;
            };
            let code = tokio::fs::read_to_string(&entry)
                .await
                .map_err(|source| OptimizerError::Io {
                    path: entry.clone(),
                    source,
                })?;
            let dep = if looks_like_commonjs(&code) {
                BundledDep {
                    code: commonjs_shim(&code),
                    needs_interop: true,
                }
            } else {
                BundledDep {
                    code,
                    needs_interop: false,
                }
            };
            debug!(specifier = %specifier, entry = %entry.display(), "bundled dependency");
            outputs.insert(specifier, dep);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::{tempdir, TempDir};

    fn project() -> TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/lib")).unwrap();
        std::fs::write(root.join("src/main.js"), "import { x } from './lib/util';\n").unwrap();
        std::fs::write(root.join("src/lib/util.js"), "export const x = 1;\n").unwrap();
        std::fs::write(root.join("src/theme.css"), "body { color: red; }\n").unwrap();

        let esm = root.join("node_modules/esm-pkg");
        std::fs::create_dir_all(esm.join("dist")).unwrap();
        std::fs::write(esm.join("package.json"), r#"{"module": "dist/index.mjs"}"#).unwrap();
        std::fs::write(esm.join("dist/index.mjs"), "export default 42;\n").unwrap();

        let cjs = root.join("node_modules/cjs-pkg");
        std::fs::create_dir_all(&cjs).unwrap();
        std::fs::write(cjs.join("index.js"), "module.exports = { answer: 42 };\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_resolve_relative_and_absolute() {
        let dir = project();
        let root = dir.path().canonicalize().unwrap();
        let fs = FsTransformer::new(&root);

        let main = fs.resolve_id("/src/main.js", None).await.unwrap().unwrap();
        assert_eq!(main.file, Some(root.join("src/main.js")));

        let util = fs.resolve_id("./lib/util", Some(&main.id)).await.unwrap().unwrap();
        assert_eq!(util.file, Some(root.join("src/lib/util.js")));

        assert!(fs.resolve_id("/src/missing.js", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_packages() {
        let dir = project();
        let root = dir.path().canonicalize().unwrap();
        let fs = FsTransformer::new(&root);

        let esm = fs.resolve_id("esm-pkg", None).await.unwrap().unwrap();
        assert_eq!(esm.file, Some(root.join("node_modules/esm-pkg/dist/index.mjs")));

        let missing = fs.resolve_id("not-installed", None).await.unwrap().unwrap();
        assert!(missing.external);
    }

    #[tokio::test]
    async fn test_css_is_self_accepting_module() {
        let dir = project();
        let root = dir.path().canonicalize().unwrap();
        let fs = FsTransformer::new(&root);
        let css = fs.resolve_id("/src/theme.css", None).await.unwrap().unwrap();
        let output = fs.transform(&css).await.unwrap();
        assert!(output.self_accepting);
        assert!(output.code.contains(r#""body { color: red; }\n""#));
        assert!(output.imports.is_empty());
    }

    #[tokio::test]
    async fn test_copy_bundler_marks_commonjs() {
        let dir = project();
        let root = dir.path().canonicalize().unwrap();
        let bundler = CopyBundler::new(Arc::new(FsTransformer::new(&root)));
        let request = BundleRequest {
            root: root.clone(),
            specifiers: ["esm-pkg", "cjs-pkg", "ghost"].iter().map(ToString::to_string).collect::<BTreeSet<_>>(),
            define: BTreeMap::new(),
            mode: "development".to_string(),
        };
        let outputs = bundler.bundle(request).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(!outputs["esm-pkg"].needs_interop);
        assert!(outputs["cjs-pkg"].needs_interop);
        assert!(outputs["cjs-pkg"].code.ends_with("export default module.exports;\n"));
    }
}
