//! Browser side of the HMR protocol, served at [`CLIENT_URL`].

/// Url the browser runtime is served from.
pub const CLIENT_URL: &str = "/@hotwire/client";

pub const CLIENT_RUNTIME: &str = r#"// hotwire HMR client
const socket = new WebSocket(`${location.protocol === 'https:' ? 'wss' : 'ws'}://${location.host}/__hmr`);
const owners = new Map();
const dataMap = new Map();
const customListeners = new Map();
const queue = [];

function send(payload) {
  if (socket.readyState === 1) socket.send(JSON.stringify(payload));
  else queue.push(payload);
}

socket.addEventListener('open', () => {
  while (queue.length) socket.send(JSON.stringify(queue.shift()));
});

function ownerState(url) {
  if (!owners.has(url)) owners.set(url, { accepts: [], dispose: null, prune: null });
  return owners.get(url);
}

async function applyUpdate({ type, path, acceptedPath, timestamp }) {
  if (type === 'css-update') {
    await import(`${acceptedPath}?import&t=${timestamp}`);
    return;
  }
  const owner = owners.get(path);
  if (!owner) return;
  const callbacks = owner.accepts.filter(({ deps }) => deps.includes(acceptedPath));
  const disposed = owners.get(acceptedPath);
  if (disposed && disposed.dispose) disposed.dispose(dataMap.get(acceptedPath));
  let mod;
  try {
    mod = await import(`${acceptedPath}?t=${timestamp}`);
  } catch (err) {
    console.error(`[hotwire] failed to reload ${acceptedPath}`, err);
    return;
  }
  for (const { deps, fn } of callbacks) fn(deps.map((dep) => (dep === acceptedPath ? mod : undefined)));
  console.debug(`[hotwire] hot updated: ${acceptedPath}`);
}

socket.addEventListener('message', async ({ data }) => {
  const payload = JSON.parse(data);
  switch (payload.type) {
    case 'connected':
      console.debug('[hotwire] connected');
      break;
    case 'update':
      for (const update of payload.updates) await applyUpdate(update);
      break;
    case 'full-reload':
      location.reload();
      break;
    case 'prune':
      for (const path of payload.paths) {
        const owner = owners.get(path);
        if (owner && owner.dispose) owner.dispose(dataMap.get(path));
        if (owner && owner.prune) owner.prune(dataMap.get(path));
        owners.delete(path);
        dataMap.delete(path);
      }
      break;
    case 'custom':
      for (const fn of customListeners.get(payload.event) || []) fn(payload.data);
      break;
    case 'error':
      console.error(`[hotwire] ${payload.err.message}\n${payload.err.stack || ''}`);
      break;
  }
});

export function createHotContext(url) {
  if (!dataMap.has(url)) dataMap.set(url, {});
  const owner = ownerState(url);
  owner.accepts = [];
  const resolve = (dep) => new URL(dep, new URL(url, location.origin)).pathname;
  return {
    get data() {
      return dataMap.get(url);
    },
    accept(deps, fn) {
      if (typeof deps === 'function' || deps === undefined) {
        owner.accepts.push({ deps: [url], fn: ([mod]) => deps && deps(mod) });
      } else {
        const list = (Array.isArray(deps) ? deps : [deps]).map(resolve);
        owner.accepts.push({ deps: list, fn: (mods) => fn && fn(Array.isArray(deps) ? mods : mods[0]) });
      }
    },
    acceptExports(_names, fn) {
      owner.accepts.push({ deps: [url], fn: ([mod]) => fn && fn(mod) });
    },
    dispose(fn) {
      owner.dispose = fn;
    },
    prune(fn) {
      owner.prune = fn;
    },
    invalidate(message) {
      send({ type: 'custom', event: 'hotwire:invalidate', data: { path: url, message } });
    },
    on(event, fn) {
      if (!customListeners.has(event)) customListeners.set(event, []);
      customListeners.get(event).push(fn);
    },
    off(event, fn) {
      const list = customListeners.get(event) || [];
      customListeners.set(event, list.filter((f) => f !== fn));
    },
    send(event, data) {
      send({ type: 'custom', event, data });
    },
  };
}
"#;

/// Give a served module its `import.meta.hot` if it uses it.
pub fn inject_hot_context(url: &str, code: &str) -> String {
    if !code.contains("import.meta.hot") {
        return code.to_string();
    }
    let url = serde_json::Value::from(url);
    format!(
        "import {{ createHotContext as __hotwire_ctx }} from '{CLIENT_URL}';\n\
         import.meta.hot = __hotwire_ctx({url});\n\
         {code}"
    )
}

/// Add the client runtime to an HTML page, before `</head>` if present.
pub fn inject_client_script(html: &str) -> String {
    if html.contains(CLIENT_URL) {
        return html.to_string();
    }
    let script = format!(r#"<script type="module" src="{CLIENT_URL}"></script>"#);
    let mut html = html.to_string();
    match html.find("</head>").or_else(|| html.find("</body>")) {
        Some(pos) => html.insert_str(pos, &format!("  {script}\n")),
        None => {
            html.push('\n');
            html.push_str(&script);
        }
    }
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_client_script_before_head_end() {
        let html = inject_client_script("<html><head><title>x</title></head><body></body></html>");
        let script = html.find(CLIENT_URL).unwrap();
        assert!(script < html.find("</head>").unwrap());
        assert_eq!(inject_client_script(&html), html);
    }

    #[test]
    fn test_inject_hot_context_only_when_used() {
        assert_eq!(inject_hot_context("/a.js", "export const a = 1;"), "export const a = 1;");
        let code = inject_hot_context("/src/a.js", "import.meta.hot.accept();");
        assert!(code.starts_with("import { createHotContext as __hotwire_ctx } from '/@hotwire/client';"));
        assert!(code.contains(r#"__hotwire_ctx("/src/a.js")"#));
    }
}
