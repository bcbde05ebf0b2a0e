use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::RunnerError;

/// How an exported binding was declared. Decides what reading it before
/// initialization yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Function,
    Let,
    Const,
    Class,
}

impl BindingKind {
    /// `let`, `const` and `class` bindings are in the temporal dead zone
    /// until assigned.
    #[must_use]
    pub fn has_tdz(self) -> bool {
        matches!(self, Self::Let | Self::Const | Self::Class)
    }
}

#[derive(Debug, Clone)]
struct Binding {
    kind: BindingKind,
    value: Option<Value>,
}

/// Live export object of an evaluated module.
///
/// Importers hold the same `Arc` the module writes to, so a binding
/// assigned after an importer got the namespace is visible to it. This is
/// what lets a circular importer receive a partially populated namespace.
#[derive(Debug, Default)]
pub struct ModuleNamespace {
    bindings: RwLock<BTreeMap<String, Binding>>,
    star_exports: RwLock<Vec<Arc<ModuleNamespace>>>,
}

impl ModuleNamespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace whose bindings are all initialized `const`s.
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let ns = Self::new();
        {
            let mut bindings = ns.bindings.write();
            for (name, value) in values {
                bindings.insert(
                    name,
                    Binding {
                        kind: BindingKind::Const,
                        value: Some(value),
                    },
                );
            }
        }
        ns
    }

    /// Hoist a binding. Functions are hoisted with their value, everything
    /// else starts uninitialized. Redeclaring keeps an existing value.
    pub fn declare(&self, name: &str, kind: BindingKind, function: Option<Value>) {
        let mut bindings = self.bindings.write();
        let entry = bindings.entry(name.to_string()).or_insert(Binding { kind, value: None });
        entry.kind = kind;
        if kind == BindingKind::Function {
            entry.value = function.or(Some(Value::Null));
        }
    }

    /// Assign a binding, declaring it as `var` if it was never declared.
    ///
    /// # Errors
    /// Reassigning an initialized `const` is an error.
    pub fn set(&self, name: &str, value: Value) -> Result<(), RunnerError> {
        let mut bindings = self.bindings.write();
        match bindings.get_mut(name) {
            Some(binding) if binding.kind == BindingKind::Const && binding.value.is_some() => {
                Err(RunnerError::ConstAssignment {
                    name: name.to_string(),
                })
            }
            Some(binding) => {
                binding.value = Some(value);
                Ok(())
            }
            None => {
                bindings.insert(
                    name.to_string(),
                    Binding {
                        kind: BindingKind::Var,
                        value: Some(value),
                    },
                );
                Ok(())
            }
        }
    }

    /// Read a binding.
    ///
    /// `Ok(None)` is `undefined`: a missing export or a `var` not assigned
    /// yet.
    ///
    /// # Errors
    /// Reading a `let`/`const`/`class` binding before it is assigned.
    pub fn get(&self, name: &str) -> Result<Option<Value>, RunnerError> {
        if let Some(binding) = self.bindings.read().get(name) {
            return match (&binding.value, binding.kind.has_tdz()) {
                (Some(value), _) => Ok(Some(value.clone())),
                (None, true) => Err(RunnerError::Uninitialized {
                    name: name.to_string(),
                }),
                (None, false) => Ok(None),
            };
        }
        if name == "default" {
            return Ok(None);
        }

        // `export *` never re-exports `default`, and may form cycles
        let mut visited: Vec<*const ModuleNamespace> = vec![self as *const Self];
        let mut queue: Vec<Arc<ModuleNamespace>> = self.star_exports.read().clone();
        while let Some(ns) = queue.pop() {
            let ptr = Arc::as_ptr(&ns);
            if visited.contains(&ptr) {
                continue;
            }
            visited.push(ptr);
            if let Some(binding) = ns.bindings.read().get(name) {
                return match (&binding.value, binding.kind.has_tdz()) {
                    (Some(value), _) => Ok(Some(value.clone())),
                    (None, true) => Err(RunnerError::Uninitialized {
                        name: name.to_string(),
                    }),
                    (None, false) => Ok(None),
                };
            }
            queue.extend(ns.star_exports.read().iter().cloned());
        }
        Ok(None)
    }

    /// `export * from ...`
    pub fn export_all(&self, from: Arc<ModuleNamespace>) {
        self.star_exports.write().push(from);
    }

    /// Whether `name` is declared on this namespace itself.
    #[must_use]
    pub fn has_own(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    /// Names declared on this namespace itself.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    /// Initialized own bindings.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.bindings
            .read()
            .iter()
            .filter_map(|(name, b)| b.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uninitialized_reads_depend_on_kind() {
        let ns = ModuleNamespace::new();
        ns.declare("a", BindingKind::Var, None);
        ns.declare("b", BindingKind::Let, None);
        ns.declare("c", BindingKind::Const, None);
        ns.declare("f", BindingKind::Function, Some(json!("fn f")));

        assert_eq!(ns.get("a"), Ok(None));
        assert_eq!(
            ns.get("b"),
            Err(RunnerError::Uninitialized {
                name: "b".to_string()
            })
        );
        assert!(ns.get("c").is_err());
        assert_eq!(ns.get("f"), Ok(Some(json!("fn f"))));
        assert_eq!(ns.get("missing"), Ok(None));

        ns.set("b", json!(1)).unwrap();
        assert_eq!(ns.get("b"), Ok(Some(json!(1))));
    }

    #[test]
    fn test_const_cannot_be_reassigned() {
        let ns = ModuleNamespace::new();
        ns.declare("value", BindingKind::Const, None);
        ns.set("value", json!("child")).unwrap();
        assert_eq!(
            ns.set("value", json!("other")),
            Err(RunnerError::ConstAssignment {
                name: "value".to_string()
            })
        );
    }

    #[test]
    fn test_star_exports_skip_default_and_survive_cycles() {
        let a = Arc::new(ModuleNamespace::from_values([
            ("default".to_string(), json!("a-default")),
            ("shared".to_string(), json!("from-a")),
        ]));
        let b = Arc::new(ModuleNamespace::new());
        b.export_all(Arc::clone(&a));
        a.export_all(Arc::clone(&b));

        assert_eq!(b.get("shared"), Ok(Some(json!("from-a"))));
        assert_eq!(b.get("default"), Ok(None));
        assert_eq!(b.get("nowhere"), Ok(None));
    }

    #[test]
    fn test_snapshot_lists_initialized_only() {
        let ns = ModuleNamespace::new();
        ns.declare("later", BindingKind::Let, None);
        ns.set("now", json!(true)).unwrap();
        assert_eq!(ns.snapshot(), BTreeMap::from([("now".to_string(), json!(true))]));
        assert_eq!(ns.names(), vec!["later".to_string(), "now".to_string()]);
    }
}
