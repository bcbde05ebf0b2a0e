//! Shared fixtures for the hotwire-core integration tests.
//!
//! [`ScriptTransformer`] serves JS-like sources from memory; the server side
//! analyzes them with the real import/accept scanner. [`ScriptEvaluator`]
//! runs the same sources line by line in the module runner, understanding
//! just enough syntax for the scenarios under test.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hotwire_core::optimizer::{is_bare_specifier, BundleRequest, BundledDep, DepBundler};
use hotwire_core::runner::{BindingKind, ModuleContext, ModuleEvaluator, ModuleNamespace, StackFrame};
use hotwire_core::{OptimizerError, ResolvedId, RunnerError, TransformError, TransformOutput, Transformer};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

pub const ROOT: &str = "/project";

pub struct ScriptTransformer {
    root: PathBuf,
    files: RwLock<HashMap<String, String>>,
}

impl ScriptTransformer {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_file(self, url: &str, code: &str) -> Self {
        self.set_file(url, code);
        self
    }

    pub fn set_file(&self, url: &str, code: &str) {
        self.files.write().insert(url.to_string(), code.to_string());
    }

    /// Absolute path backing `url`.
    pub fn path(&self, url: &str) -> PathBuf {
        self.root.join(url.trim_start_matches('/'))
    }

    fn root_str(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }
}

pub fn join_url(importer: &str, specifier: &str) -> String {
    let mut segments: Vec<&str> = importer.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    for part in specifier.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[async_trait]
impl Transformer for ScriptTransformer {
    async fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> Result<Option<ResolvedId>, TransformError> {
        if is_bare_specifier(specifier) {
            return Ok(Some(ResolvedId::external(specifier)));
        }
        let root = self.root_str();
        let url = if specifier.starts_with('/') {
            specifier.split('?').next().unwrap_or(specifier).to_string()
        } else {
            match importer.and_then(|i| i.strip_prefix(root.as_str())) {
                Some(importer_url) => join_url(importer_url, specifier),
                None => return Ok(None),
            }
        };
        if !self.files.read().contains_key(&url) {
            return Ok(None);
        }
        Ok(Some(ResolvedId::new(format!("{root}{url}"), Some(self.path(&url)))))
    }

    async fn transform(&self, module: &ResolvedId) -> Result<TransformOutput, TransformError> {
        let root = self.root_str();
        let code = module
            .id
            .strip_prefix(root.as_str())
            .and_then(|url| self.files.read().get(url).cloned())
            .ok_or_else(|| TransformError::failed(&module.id, "file not found"))?;
        TransformOutput::analyze(code, None).map_err(|e| TransformError::failed(&module.id, e.to_string()))
    }
}

/// Bundler that emits `export default '<specifier>'` per dependency.
#[derive(Default)]
pub struct EchoBundler {
    calls: AtomicUsize,
}

impl EchoBundler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DepBundler for EchoBundler {
    async fn bundle(&self, request: BundleRequest) -> Result<BTreeMap<String, BundledDep>, OptimizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request
            .specifiers
            .into_iter()
            .map(|spec| {
                let code = format!("export default '{spec}';\n");
                (
                    spec,
                    BundledDep {
                        code,
                        needs_interop: false,
                    },
                )
            })
            .collect())
    }
}

/// Line interpreter for the JS subset the fixtures use.
#[derive(Default)]
pub struct ScriptEvaluator {
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptEvaluator {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|l| *l == entry).count()
    }

    /// Wait until the log contains `entry`.
    pub async fn wait_for(&self, entry: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.log.lock().iter().any(|l| l == entry) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {entry:?}, log: {:?}",
                self.log()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn snapshot(ns: &ModuleNamespace) -> String {
    serde_json::to_string(&ns.snapshot()).unwrap_or_default()
}

fn quoted(text: &str) -> Option<&str> {
    let start = text.find(['\'', '"'])?;
    let quote = text[start..].chars().next()?;
    let rest = &text[start + 1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

fn binding_names(line: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (line.find('{'), line.find('}')) else {
        return Vec::new();
    };
    line[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl ModuleEvaluator for ScriptEvaluator {
    async fn run_inlined_module(&self, context: ModuleContext, code: &str) -> Result<(), RunnerError> {
        let mut scope: HashMap<String, Value> = HashMap::new();
        let eval = |expr: &str, scope: &HashMap<String, Value>| -> Value {
            let expr = expr.trim().trim_end_matches(';').trim();
            match quoted(expr) {
                Some(text) if expr.starts_with(['\'', '"']) => Value::from(text),
                _ => scope.get(expr).cloned().unwrap_or(Value::Null),
            }
        };

        for (index, raw) in code.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(args) = line.strip_prefix("import.meta.hot.accept(") {
                let Some(hot) = context.hot() else { continue };
                let owner = context.url().to_string();
                let log = Arc::clone(&self.log);
                if args.starts_with(['\'', '"']) {
                    let dep = quoted(args).unwrap_or_default().to_string();
                    hot.accept_deps(&[dep.as_str()], move |modules| {
                        let updated = modules.iter().flatten().next().map(|ns| snapshot(ns));
                        log.lock()
                            .push(format!("accept-dep {owner} {}", updated.unwrap_or_default()));
                    });
                } else if args.contains("invalidate") {
                    let handle = hot.clone();
                    hot.accept_self(move |_| {
                        log.lock().push(format!("invalidate {owner}"));
                        handle.invalidate(Some("cannot apply"));
                    });
                } else {
                    hot.accept_self(move |module| {
                        let updated = module.map(|ns| snapshot(&ns)).unwrap_or_default();
                        log.lock().push(format!("accept {owner} {updated}"));
                    });
                }
            } else if line.starts_with("import.meta.hot.dispose(") {
                if let Some(hot) = context.hot() {
                    let owner = context.url().to_string();
                    let log = Arc::clone(&self.log);
                    hot.dispose(move |_| log.lock().push(format!("dispose {owner}")));
                }
            } else if let Some(rest) = line.strip_prefix("await import(") {
                let spec = quoted(rest).unwrap_or_default();
                context.dynamic_import(spec).await?;
            } else if line.starts_with("import ") {
                let spec = line
                    .rsplit_once(" from ")
                    .map_or(line, |(_, spec)| spec);
                let spec = quoted(spec).unwrap_or_default();
                let ns = context.import(spec).await?;
                for name in binding_names(line) {
                    let value = ns.get(&name)?.unwrap_or(Value::Null);
                    scope.insert(name, value);
                }
            } else if let Some(rest) = line.strip_prefix("export const ") {
                let (name, expr) = rest.split_once('=').unwrap_or((rest, "null"));
                let name = name.trim();
                context.exports().declare(name, BindingKind::Const, None);
                context.exports().set(name, eval(expr, &scope))?;
            } else if let Some(rest) = line.strip_prefix("export let ") {
                let name = rest.trim_end_matches(';').trim();
                context.exports().declare(name, BindingKind::Let, None);
            } else if let Some(rest) = line.strip_prefix("log(") {
                let value = eval(rest.trim_end_matches(';').trim_end_matches(')'), &scope);
                let text = value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
                self.log.lock().push(text);
            } else if let Some(rest) = line.strip_prefix("throw new Error(") {
                return Err(RunnerError::Evaluation {
                    id: context.id().to_string(),
                    message: quoted(rest).unwrap_or_default().to_string(),
                    stack: vec![StackFrame::new(
                        context.url(),
                        u32::try_from(index + 1).unwrap_or(u32::MAX),
                        1,
                    )],
                });
            }
        }
        Ok(())
    }

    async fn run_external_module(&self, specifier: &str) -> Result<Arc<ModuleNamespace>, RunnerError> {
        Ok(Arc::new(ModuleNamespace::from_values([(
            "default".to_string(),
            Value::from(format!("external:{specifier}")),
        )])))
    }
}
