//! `hotwire dev` command implementation.
//!
//! ## Routes
//!
//! ```text
//! GET /__hmr            → WebSocket, one HMR client per connection
//! GET /@hotwire/client  → browser HMR runtime
//! GET /@deps/<file>     → optimized dependency bundles
//! GET /<module>         → DevSession::fetch_module, imports rewritten to urls
//! GET /<anything else>  → static file from the root, index.html fallback
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hotwire_core::config::ServerConfig;
use hotwire_core::optimizer::DepBundler;
use hotwire_core::transport::TransportChannel;
use hotwire_core::{DevSession, Transformer};
use hotwire_proto::FetchResult;
use miette::{IntoDiagnostic, Result};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::client::{inject_client_script, inject_hot_context, CLIENT_RUNTIME, CLIENT_URL};
use super::project::{CopyBundler, FsTransformer};
use super::watch::{self, IgnoreRules};
use super::ws::WsChannel;
use super::ProjectArgs;

/// Extensions served through the transform pipeline.
const MODULE_EXTENSIONS: &[&str] = &["js", "mjs", "jsx", "ts", "tsx", "json"];

const JS: &str = "application/javascript";

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    pub project: ProjectArgs,
    /// Port override.
    pub port: Option<u16>,
    /// Host override.
    pub host: Option<String>,
}

/// Run the dev server until Ctrl+C.
pub async fn run(action: DevAction) -> Result<()> {
    let mut config = action.project.load()?;
    if let Some(port) = action.port {
        config.server.port = port;
    }
    if let Some(host) = action.host {
        config.server.host = host;
    }
    let root = config.root.clone();
    let server = config.server.clone();
    let ignore = IgnoreRules::for_config(&config);

    let transformer = Arc::new(FsTransformer::new(&root));
    let bundler: Arc<dyn DepBundler> = Arc::new(CopyBundler::new(Arc::clone(&transformer)));
    let session = DevSession::new(config, transformer as Arc<dyn Transformer>, Some(bundler));
    if let Some(metadata) = session.start().await {
        info!(deps = metadata.optimized.len(), hash = %metadata.hash, "dependencies ready");
    }

    let (_watcher, mut batches) = watch::spawn(&root, ignore).into_diagnostic()?;
    let watch_session = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            for (kind, files) in batch {
                let outcome = watch_session.handle_file_event(kind, &files);
                debug!(?kind, files = files.len(), ?outcome, "file event handled");
            }
        }
    });

    let addr = socket_addr(&server)?;
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    info!(address = %addr, root = %root.display(), "dev server listening");
    println!();
    println!("  Dev server running at http://{}:{}", server.host, server.port);
    println!("  Press Ctrl+C to stop");
    println!();

    axum::serve(listener, router(Arc::clone(&session)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;

    session.close();
    Ok(())
}

fn socket_addr(server: &ServerConfig) -> Result<SocketAddr> {
    let host = if server.host == "localhost" {
        "127.0.0.1"
    } else {
        server.host.as_str()
    };
    format!("{host}:{}", server.port).parse().into_diagnostic()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub(crate) fn router(session: Arc<DevSession>) -> Router {
    Router::new()
        .route("/__hmr", get(hmr_websocket))
        .route(CLIENT_URL, get(serve_client))
        .route("/@deps/*file", get(serve_dep))
        .fallback(serve_module)
        .layer(CorsLayer::permissive())
        .with_state(session)
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<String>) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body.into(),
    )
        .into_response()
}

async fn hmr_websocket(ws: WebSocketUpgrade, State(session): State<Arc<DevSession>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let channel = Arc::new(WsChannel::new(socket));
        let transport: Arc<dyn TransportChannel> = channel.clone();
        let client = session.connect_client(transport);
        channel.closed().await;
        session.disconnect_client(client);
    })
}

async fn serve_client() -> Response {
    respond(StatusCode::OK, JS, CLIENT_RUNTIME)
}

async fn serve_dep(State(session): State<Arc<DevSession>>, uri: Uri) -> Response {
    let code = session
        .optimizer()
        .and_then(|optimizer| optimizer.optimized_code_for_url(uri.path()));
    match code {
        Some(code) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, JS),
                (header::CACHE_CONTROL, "max-age=31536000, immutable"),
            ],
            code.to_string(),
        )
            .into_response(),
        None => respond(
            StatusCode::NOT_FOUND,
            JS,
            format!("// optimized dependency not found: {}", uri.path()),
        ),
    }
}

/// Stylesheets imported from JS are requested as modules.
fn module_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    if !path.ends_with(".css") {
        return url.to_string();
    }
    match url.split_once('?') {
        Some((path, query)) => format!("{path}?import&{query}"),
        None => format!("{url}?import"),
    }
}

/// Replace each quoted import specifier with the url it was served under.
fn rewrite_imports(code: &str, imports: &BTreeMap<String, String>) -> String {
    let mut code = code.to_string();
    for (specifier, url) in imports {
        let url = module_url(url);
        if *specifier == url {
            continue;
        }
        for quote in ['\'', '"'] {
            code = code.replace(&format!("{quote}{specifier}{quote}"), &format!("{quote}{url}{quote}"));
        }
    }
    code
}

fn is_module_request(path: &str, query: Option<&str>) -> bool {
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("");
    MODULE_EXTENSIONS.contains(&ext) || (ext == "css" && query.is_some_and(|q| q.contains("import")))
}

async fn serve_module(State(session): State<Arc<DevSession>>, uri: Uri) -> Response {
    let path = uri.path();
    if path.split('/').any(|part| part == "..") {
        return respond(StatusCode::BAD_REQUEST, "text/plain", "invalid path");
    }
    if !is_module_request(path, uri.query()) {
        return serve_static(&session.config().root, path).await;
    }

    match session.fetch_module(path, None).await {
        Ok(FetchResult::Inlined { url, code, imports, .. }) => {
            let code = rewrite_imports(&code, &imports);
            respond(StatusCode::OK, JS, inject_hot_context(&url, &code))
        }
        Ok(FetchResult::External { specifier }) => respond(
            StatusCode::NOT_FOUND,
            JS,
            format!("// {specifier} is not served by the dev server"),
        ),
        Err(e) if e.is_not_found() => respond(StatusCode::NOT_FOUND, JS, format!("// not found: {path}")),
        Err(e) => {
            let message = serde_json::Value::from(e.to_string());
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                JS,
                format!("console.error({message});"),
            )
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

async fn serve_static(root: &Path, path: &str) -> Response {
    let relative = path.trim_start_matches('/');
    let mut file = if relative.is_empty() {
        root.join("index.html")
    } else {
        root.join(relative)
    };
    // Extension-less routes belong to the client-side router
    if !file.is_file() && Path::new(relative).extension().is_none() {
        file = root.join("index.html");
    }

    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            let content_type = content_type_for(&file);
            if content_type == "text/html" {
                let html = String::from_utf8_lossy(&bytes);
                return respond(StatusCode::OK, content_type, inject_client_script(&html));
            }
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => respond(StatusCode::NOT_FOUND, "text/plain", format!("not found: {path}")),
    }
}
