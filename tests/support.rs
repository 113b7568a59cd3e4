#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use crm_login_lib::{AppResult, BrowserOpener, LoginSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that read or mutate process environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct EnvRestore {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvRestore {
    fn save_once(&mut self, key: &'static str) {
        if self.saved.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.saved.push((key, std::env::var_os(key)));
    }

    pub fn set_var(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.save_once(key);
        std::env::set_var(key, value.into());
    }

    pub fn remove_var(&mut self, key: &'static str) {
        self.save_once(key);
        std::env::remove_var(key);
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Canned responses for the mock OAuth provider.
#[derive(Debug, Clone)]
pub struct ProviderBehavior {
    pub token_status: StatusCode,
    pub token_body: String,
    pub userinfo_status: StatusCode,
    pub userinfo_body: String,
}

pub const ACCESS_TOKEN: &str = "ya29.mock-access-token-0001";

impl Default for ProviderBehavior {
    fn default() -> Self {
        Self {
            token_status: StatusCode::OK,
            token_body: format!(
                r#"{{"access_token":"{ACCESS_TOKEN}","token_type":"Bearer","expires_in":3599,"scope":"openid email profile"}}"#
            ),
            userinfo_status: StatusCode::OK,
            userinfo_body: r#"{"id":"42","email":"a@b.com","name":"A B"}"#.to_string(),
        }
    }
}

struct ProviderInner {
    behavior: ProviderBehavior,
    token_hits: AtomicUsize,
    userinfo_hits: AtomicUsize,
    last_token_form: Mutex<Option<HashMap<String, String>>>,
    last_authorization: Mutex<Option<String>>,
}

/// Token and userinfo endpoints served by axum on an ephemeral loopback port.
pub struct MockProvider {
    pub base_url: String,
    inner: Arc<ProviderInner>,
    shutdown: Option<oneshot::Sender<()>>,
}

async fn token_endpoint(
    State(inner): State<Arc<ProviderInner>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    inner.token_hits.fetch_add(1, Ordering::SeqCst);
    *inner.last_token_form.lock().expect("lock form") = Some(form);
    (
        inner.behavior.token_status,
        [(header::CONTENT_TYPE, "application/json")],
        inner.behavior.token_body.clone(),
    )
}

async fn userinfo_endpoint(
    State(inner): State<Arc<ProviderInner>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    inner.userinfo_hits.fetch_add(1, Ordering::SeqCst);
    *inner.last_authorization.lock().expect("lock auth") = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (
        inner.behavior.userinfo_status,
        [(header::CONTENT_TYPE, "application/json")],
        inner.behavior.userinfo_body.clone(),
    )
}

impl MockProvider {
    pub async fn start(behavior: ProviderBehavior) -> Self {
        let inner = Arc::new(ProviderInner {
            behavior,
            token_hits: AtomicUsize::new(0),
            userinfo_hits: AtomicUsize::new(0),
            last_token_form: Mutex::new(None),
            last_authorization: Mutex::new(None),
        });
        let app = Router::new()
            .route("/token", post(token_endpoint))
            .route("/userinfo", get(userinfo_endpoint))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock provider");
        let addr = listener.local_addr().expect("mock provider addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            base_url: format!("http://{addr}"),
            inner,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn token_hits(&self) -> usize {
        self.inner.token_hits.load(Ordering::SeqCst)
    }

    pub fn userinfo_hits(&self) -> usize {
        self.inner.userinfo_hits.load(Ordering::SeqCst)
    }

    pub fn last_token_form(&self) -> Option<HashMap<String, String>> {
        self.inner.last_token_form.lock().expect("lock form").clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.inner.last_authorization.lock().expect("lock auth").clone()
    }

    /// Settings pointing the flow at this provider, with short deadlines for tests.
    pub fn settings(&self) -> LoginSettings {
        LoginSettings {
            preferred_callback_port: 0,
            client_id: "test-client-id".to_string(),
            auth_url: format!("{}/auth", self.base_url),
            token_url: format!("{}/token", self.base_url),
            userinfo_url: format!("{}/userinfo", self.base_url),
            callback_timeout_seconds: 10,
            close_ping_timeout_seconds: 10,
            page_identity_wait_ms: 5_000,
            ..LoginSettings::default()
        }
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Records every URL it is asked to open instead of launching a browser.
#[derive(Default)]
pub struct RecordingBrowser {
    urls: Mutex<Vec<String>>,
}

impl RecordingBrowser {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().expect("lock urls").clone()
    }
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) -> AppResult<()> {
        self.urls.lock().expect("lock urls").push(url.to_string());
        Ok(())
    }
}

pub struct FailingBrowser;

impl BrowserOpener for FailingBrowser {
    fn open(&self, _url: &str) -> AppResult<()> {
        Err("SYSTEM_ERROR: no display available".to_string().into())
    }
}

pub fn query_param(url: &str, key: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .expect("valid url")
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Simulated browser request against the loopback listener.
pub async fn browser_get(port: u16, path_and_query: &str) -> (u16, String) {
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("browser client");
    let response = client
        .get(format!("http://127.0.0.1:{port}{path_and_query}"))
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .expect("browser request");
    let status = response.status().as_u16();
    let body = response.text().await.expect("browser body");
    (status, body)
}

/// Sends raw bytes and returns everything the server wrote back before closing.
pub async fn raw_request(port: u16, request: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .expect("response in time")
        .expect("read response");
    String::from_utf8_lossy(&out).to_string()
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .expect("bind free port")
        .local_addr()
        .expect("free port addr")
        .port()
}
