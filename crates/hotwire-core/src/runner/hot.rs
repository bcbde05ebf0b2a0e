//! Runner side of the hot update API.
//!
//! [`HmrClient`] holds every module's registrations; [`HotContext`] is the
//! per-module handle a module sees as `import.meta.hot`.

use std::collections::HashMap;
use std::sync::Arc;

use hotwire_proto::{events, HotPayload, InvalidateMessage};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::evaluated::EvaluatedModules;
use super::join_relative;
use super::namespace::ModuleNamespace;
use crate::graph::strip_timestamp_query;
use crate::transport::TransportChannel;

/// Module-scoped state that survives hot updates (`import.meta.hot.data`).
pub type HotData = Arc<Mutex<serde_json::Map<String, Value>>>;

pub type AcceptCallback = Arc<dyn Fn(&[Option<Arc<ModuleNamespace>>]) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(&HotData) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// What an accept registration covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptKind {
    /// The module accepts its own updates.
    SelfAccept,
    /// The module accepts updates of these dependency urls.
    Deps(Vec<String>),
}

#[derive(Clone)]
pub struct HotCallback {
    pub kind: AcceptKind,
    callback: AcceptCallback,
}

impl HotCallback {
    /// Urls this registration accepts, given the owning module's url.
    #[must_use]
    pub fn deps<'a>(&'a self, owner: &'a str) -> Vec<&'a str> {
        match &self.kind {
            AcceptKind::SelfAccept => vec![owner],
            AcceptKind::Deps(deps) => deps.iter().map(String::as_str).collect(),
        }
    }

    pub fn call(&self, modules: &[Option<Arc<ModuleNamespace>>]) {
        (self.callback)(modules);
    }
}

#[derive(Default)]
struct Registry {
    accepts: HashMap<String, Vec<HotCallback>>,
    dispose: HashMap<String, DataCallback>,
    prune: HashMap<String, DataCallback>,
    data: HashMap<String, HotData>,
    listeners: HashMap<String, Vec<(String, EventCallback)>>,
}

/// Hot registrations of every module evaluated by one runner.
pub struct HmrClient {
    channel: Arc<dyn TransportChannel>,
    modules: Arc<EvaluatedModules>,
    registry: Mutex<Registry>,
}

impl HmrClient {
    pub(crate) fn new(channel: Arc<dyn TransportChannel>, modules: Arc<EvaluatedModules>) -> Self {
        Self {
            channel,
            modules,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Accept registrations of `owner`.
    #[must_use]
    pub fn callbacks(&self, owner: &str) -> Vec<HotCallback> {
        self.registry
            .lock()
            .accepts
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_registered(&self, owner: &str) -> bool {
        self.registry.lock().accepts.contains_key(owner)
    }

    /// Run and remove the dispose callback of `path`.
    pub fn dispose(&self, path: &str) {
        let (callback, data) = {
            let mut registry = self.registry.lock();
            let callback = registry.dispose.remove(path);
            (callback, registry.data.get(path).cloned())
        };
        if let Some(callback) = callback {
            debug!(path, "running dispose callback");
            callback(&data.unwrap_or_default());
        }
    }

    /// Dispose and prune modules removed from the server graph.
    pub fn prune_paths(&self, paths: &[String]) {
        for path in paths {
            self.dispose(path);
            let (callback, data) = {
                let mut registry = self.registry.lock();
                registry.accepts.remove(path);
                let callback = registry.prune.remove(path);
                (callback, registry.data.remove(path))
            };
            if let Some(callback) = callback {
                debug!(path = %path, "running prune callback");
                callback(&data.unwrap_or_default());
            }
            self.modules.remove_url(path);
        }
    }

    /// Call every listener registered for `event`.
    pub fn notify_listeners(&self, event: &str, data: &Value) {
        let listeners: Vec<EventCallback> = self
            .registry
            .lock()
            .listeners
            .get(event)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(data);
        }
    }

    /// Drop all registrations, e.g. before a full reload.
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.accepts.clear();
        registry.dispose.clear();
        registry.prune.clear();
        registry.listeners.clear();
    }

    pub(crate) fn send(&self, payload: HotPayload) {
        self.channel.send(payload);
    }
}

/// `import.meta.hot` of one module.
#[derive(Clone)]
pub struct HotContext {
    client: Arc<HmrClient>,
    owner: String,
    imports: Arc<HashMap<String, String>>,
}

impl HotContext {
    /// Create the context for a (re-)evaluation of `owner`. Registrations
    /// from the previous evaluation are dropped; `data` is kept.
    pub(crate) fn new(
        client: Arc<HmrClient>,
        owner: &str,
        imports: Arc<HashMap<String, String>>,
    ) -> Self {
        let owner = strip_timestamp_query(owner);
        {
            let mut registry = client.registry.lock();
            registry.data.entry(owner.clone()).or_default();
            registry.accepts.remove(&owner);
            for entries in registry.listeners.values_mut() {
                entries.retain(|(registered_by, _)| *registered_by != owner);
            }
        }
        Self {
            client,
            owner,
            imports,
        }
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn data(&self) -> HotData {
        self.client
            .registry
            .lock()
            .data
            .entry(self.owner.clone())
            .or_default()
            .clone()
    }

    fn register(&self, kind: AcceptKind, callback: AcceptCallback) {
        self.client
            .registry
            .lock()
            .accepts
            .entry(self.owner.clone())
            .or_default()
            .push(HotCallback { kind, callback });
    }

    /// `import.meta.hot.accept(cb)`
    pub fn accept_self(&self, callback: impl Fn(Option<Arc<ModuleNamespace>>) + Send + Sync + 'static) {
        self.register(
            AcceptKind::SelfAccept,
            Arc::new(move |modules| callback(modules.first().cloned().flatten())),
        );
    }

    /// `import.meta.hot.accept(deps, cb)`. The callback receives one slot
    /// per dep, filled for the dep that was updated.
    pub fn accept_deps(
        &self,
        deps: &[&str],
        callback: impl Fn(&[Option<Arc<ModuleNamespace>>]) + Send + Sync + 'static,
    ) {
        let deps = deps.iter().map(|dep| self.resolve_dep(dep)).collect();
        self.register(AcceptKind::Deps(deps), Arc::new(callback));
    }

    /// `import.meta.hot.acceptExports(names, cb)`. In the runner this
    /// accepts like `accept_self`; the server decides whether the importers'
    /// bindings allow it.
    pub fn accept_exports(
        &self,
        _names: &[&str],
        callback: impl Fn(Option<Arc<ModuleNamespace>>) + Send + Sync + 'static,
    ) {
        self.accept_self(callback);
    }

    pub fn dispose(&self, callback: impl Fn(&HotData) + Send + Sync + 'static) {
        self.client
            .registry
            .lock()
            .dispose
            .insert(self.owner.clone(), Arc::new(callback));
    }

    pub fn prune(&self, callback: impl Fn(&HotData) + Send + Sync + 'static) {
        self.client
            .registry
            .lock()
            .prune
            .insert(self.owner.clone(), Arc::new(callback));
    }

    /// Give up on accepting the current update: forget the evaluated module
    /// and ask the server to propagate from its importers.
    pub fn invalidate(&self, message: Option<&str>) {
        self.client.modules.invalidate_url(&self.owner);
        let request = InvalidateMessage {
            path: self.owner.clone(),
            message: message.map(ToString::to_string),
        };
        match HotPayload::custom(events::INVALIDATE, &request) {
            Ok(payload) => {
                let data = match &payload {
                    HotPayload::Custom { data, .. } => data.clone(),
                    _ => Value::Null,
                };
                self.client.notify_listeners(events::INVALIDATE, &data);
                self.client.send(payload);
            }
            Err(e) => warn!(error = %e, "failed to encode invalidate message"),
        }
    }

    pub fn on(&self, event: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.client
            .registry
            .lock()
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((self.owner.clone(), Arc::new(callback)));
    }

    /// Remove this module's listeners for `event`.
    pub fn off(&self, event: &str) {
        if let Some(entries) = self.client.registry.lock().listeners.get_mut(event) {
            entries.retain(|(registered_by, _)| *registered_by != self.owner);
        }
    }

    /// Send a custom event to the server.
    pub fn send(&self, event: &str, data: Value) {
        self.client.send(HotPayload::Custom {
            event: event.to_string(),
            data,
        });
    }

    /// Url of an importer-relative dep specifier.
    fn resolve_dep(&self, specifier: &str) -> String {
        if let Some(url) = self.imports.get(specifier) {
            return strip_timestamp_query(url);
        }
        if specifier.starts_with('.') {
            return join_relative(&self.owner, specifier);
        }
        specifier.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessChannel;

    fn client() -> (Arc<HmrClient>, InProcessChannel) {
        let (runner_end, server_end) = InProcessChannel::pair();
        let client = Arc::new(HmrClient::new(
            Arc::new(runner_end),
            Arc::new(EvaluatedModules::new()),
        ));
        (client, server_end)
    }

    #[test]
    fn test_accept_registry_is_tagged() {
        let (client, _server) = client();
        let imports = Arc::new(HashMap::from([(
            "./child.js".to_string(),
            "/src/child.js?t=3".to_string(),
        )]));
        let hot = HotContext::new(Arc::clone(&client), "/src/parent.js", imports);
        hot.accept_self(|_| {});
        hot.accept_deps(&["./child.js", "../lib/util.js"], |_| {});

        let callbacks = client.callbacks("/src/parent.js");
        assert_eq!(callbacks[0].kind, AcceptKind::SelfAccept);
        assert_eq!(callbacks[0].deps("/src/parent.js"), vec!["/src/parent.js"]);
        assert_eq!(
            callbacks[1].kind,
            AcceptKind::Deps(vec!["/src/child.js".to_string(), "/lib/util.js".to_string()])
        );
    }

    #[test]
    fn test_reevaluation_drops_callbacks_but_keeps_data() {
        let (client, _server) = client();
        let hot = HotContext::new(Arc::clone(&client), "/a.js", Arc::default());
        hot.accept_self(|_| {});
        hot.data().lock().insert("count".to_string(), Value::from(1));

        let hot = HotContext::new(Arc::clone(&client), "/a.js?t=10", Arc::default());
        assert!(client.callbacks("/a.js").is_empty());
        assert_eq!(hot.data().lock().get("count"), Some(&Value::from(1)));
    }

    #[test]
    fn test_dispose_and_prune_callbacks_receive_data() {
        let (client, _server) = client();
        let hot = HotContext::new(Arc::clone(&client), "/a.js", Arc::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        hot.dispose(move |data| {
            data.lock().insert("disposed".to_string(), Value::Bool(true));
            sink.lock().push("dispose");
        });
        let sink = Arc::clone(&seen);
        hot.prune(move |data| {
            assert_eq!(data.lock().get("disposed"), Some(&Value::Bool(true)));
            sink.lock().push("prune");
        });

        client.prune_paths(&["/a.js".to_string()]);
        assert_eq!(*seen.lock(), vec!["dispose", "prune"]);
    }

    #[test]
    fn test_invalidate_sends_custom_event() {
        let (client, server) = client();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.on_message(Arc::new(move |payload: &HotPayload| {
            sink.lock().push(payload.clone());
        }));
        server.listen();

        let hot = HotContext::new(client, "/a.js", Arc::default());
        hot.invalidate(Some("cannot accept"));

        let received = received.lock();
        let HotPayload::Custom { event, data } = &received[0] else {
            panic!("expected custom event");
        };
        assert_eq!(event, events::INVALIDATE);
        assert_eq!(data["path"], "/a.js");
        assert_eq!(data["message"], "cannot accept");
    }

    #[test]
    fn test_listeners_and_off() {
        let (client, _server) = client();
        let hot = HotContext::new(Arc::clone(&client), "/a.js", Arc::default());
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        hot.on("app:refresh", move |_| *sink.lock() += 1);

        client.notify_listeners("app:refresh", &Value::Null);
        hot.off("app:refresh");
        client.notify_listeners("app:refresh", &Value::Null);
        assert_eq!(*hits.lock(), 1);
    }
}
