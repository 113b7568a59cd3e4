//! Usage: Minimal static file server for the bundled web assets.

use crate::shared::error::{AppError, AppResult, SYSTEM_ERROR};
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const INDEX_PATH: &str = "/index.html";
const DEFAULT_MIME: &str = "application/octet-stream";
const BIND_HOST: &str = "127.0.0.1";

const MIME_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("svg", "image/svg+xml"),
    ("txt", "text/plain"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("eot", "application/vnd.ms-fontobject"),
    ("otf", "font/otf"),
    ("wasm", "application/wasm"),
];

pub(crate) fn mime_type_for(path: &str) -> &'static str {
    let Some((_, ext)) = path.rsplit_once('.') else {
        return DEFAULT_MIME;
    };
    if ext.contains('/') {
        return DEFAULT_MIME;
    }
    let ext = ext.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME)
}

/// Directory the running executable lives in; the default asset root.
pub fn executable_dir() -> AppResult<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| AppError::with_source(SYSTEM_ERROR, "failed to locate executable", e))?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| AppError::new(SYSTEM_ERROR, "executable has no parent directory"))
}

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

fn text(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, PLAIN_TEXT)], body).into_response()
}

async fn serve_file(State(root): State<Arc<PathBuf>>, method: Method, uri: Uri) -> Response {
    let requested = uri.path();
    let response = resolve_request(&root, &method, requested).await;
    tracing::info!(
        method = %method,
        path = requested,
        status = response.status().as_u16(),
        "static request"
    );
    response
}

async fn resolve_request(root: &Path, method: &Method, requested: &str) -> Response {
    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }
    // Raw path check: any `..` is refused before touching the filesystem.
    if requested.contains("..") {
        return text(StatusCode::FORBIDDEN, "Forbidden");
    }

    let path = if requested == "/" { INDEX_PATH } else { requested };
    let file_path = root.join(path.trim_start_matches('/'));
    match tokio::fs::read(&file_path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime_type_for(path))
            .body(Body::from(bytes))
            .unwrap_or_else(|_| text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")),
        Err(err) => {
            tracing::debug!(path = %file_path.display(), "static file unavailable: {err}");
            text(StatusCode::NOT_FOUND, "Not Found")
        }
    }
}

pub(crate) fn build_router(root: PathBuf) -> Router {
    Router::new()
        .fallback(serve_file)
        .with_state(Arc::new(root))
}

pub struct StaticFileServer {
    port: u16,
    root: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StaticFileServer {
    /// Binds `127.0.0.1:<port>` exactly; a busy port is an error rather than a fallback.
    pub async fn start(root: PathBuf, port: u16) -> AppResult<Self> {
        let listener = tokio::net::TcpListener::bind((BIND_HOST, port))
            .await
            .map_err(|e| {
                AppError::with_source(
                    SYSTEM_ERROR,
                    format!("static server bind failed on {BIND_HOST}:{port}: {e}"),
                    e,
                )
            })?;
        let bind_addr: SocketAddr = listener
            .local_addr()
            .map_err(|e| AppError::with_source(SYSTEM_ERROR, "static server local_addr failed", e))?;

        let app = build_router(root.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(bind_addr = %bind_addr, "static server error: {err}");
            }
        });

        tracing::info!(bind_addr = %bind_addr, root = %root.display(), "static server listening");
        Ok(Self {
            port: bind_addr.port(),
            root,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(port = self.port, "static server stopped");
    }
}

impl Drop for StaticFileServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
