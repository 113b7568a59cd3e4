//! Usage: Loopback HTTP listener that captures the OAuth redirect and the success page's close ping.
//!
//! Only the request line is interpreted. Each accepted connection is served on its own task and
//! talks to the orchestrator exclusively through [`ListenerEvent`]s and the [`PagePublisher`].

use crate::shared::error::{AppError, AppResult, SYSTEM_ERROR};
use crate::shared::mutex_ext::MutexExt;
use crate::shared::security::escape_html;
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use super::providers::make_redirect_uri;
use super::userinfo::UserIdentity;

const MAX_REQUEST_HEAD_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_PATH: &str = "/close";
const PLACEHOLDER_BODY: &str = "Received";
const ERROR_ACK_BODY: &str = "Authentication failed. You may close this window and retry.";
const BAD_REQUEST_BODY: &str = "Bad Request";
const GENERIC_EMAIL: &str = "Signed in";
const GENERIC_NAME: &str = "User";

/// Query parameters decoded from the redirect. Keys keep first-seen order; a repeated key
/// keeps its original position and takes the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pairs: Vec<(String, String)>,
}

impl CallbackParams {
    pub(crate) fn insert(&mut self, key: String, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn is_callback(&self) -> bool {
        self.contains("code") || self.contains("error")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CallbackParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = CallbackParams::default();
        for (k, v) in iter {
            params.insert(k.into(), v.into());
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerEvent {
    CallbackReceived(CallbackParams),
    ReadyToProceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    CallbackReceived,
    Closed,
}

/// What the success page should show once the orchestrator knows the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PageOutcome {
    Pending,
    Identity(UserIdentity),
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct PagePublisher {
    tx: Arc<watch::Sender<PageOutcome>>,
}

impl PagePublisher {
    pub(crate) fn publish(&self, outcome: PageOutcome) {
        self.tx.send_replace(outcome);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestTarget {
    pub(crate) path: String,
    pub(crate) params: CallbackParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Close,
    Callback(CallbackParams),
    Placeholder,
    BadRequest,
}

/// Splits the first request line; anything but `GET <target> HTTP/x` is rejected.
pub(crate) fn extract_request_target(request: &str) -> AppResult<&str> {
    let first = request
        .lines()
        .next()
        .ok_or_else(|| "SYSTEM_ERROR: oauth callback malformed request".to_string())?;
    let mut parts = first.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if method != "GET" {
        return Err("SYSTEM_ERROR: oauth callback must be GET"
            .to_string()
            .into());
    }
    if !target.starts_with('/') || !version.starts_with("HTTP/") || parts.next().is_some() {
        return Err("SYSTEM_ERROR: oauth callback malformed request line"
            .to_string()
            .into());
    }
    Ok(target)
}

/// Percent-decodes the query (with `+` as space) into [`CallbackParams`].
pub(crate) fn parse_request_target(target: &str) -> AppResult<RequestTarget> {
    let url = Url::parse(&format!("http://localhost{target}"))
        .map_err(|e| format!("SYSTEM_ERROR: invalid oauth callback target: {e}"))?;
    let params = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok(RequestTarget {
        path: url.path().to_string(),
        params,
    })
}

pub(crate) fn route_request(request: &str) -> Route {
    let Ok(target) = extract_request_target(request) else {
        return Route::BadRequest;
    };
    let Ok(parsed) = parse_request_target(target) else {
        return Route::BadRequest;
    };
    if parsed.path == CLOSE_PATH {
        return Route::Close;
    }
    if parsed.params.is_callback() {
        return Route::Callback(parsed.params);
    }
    Route::Placeholder
}

fn http_response(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nConnection: close\r\nCache-Control: no-cache\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn text_response(status: &str, body: &str) -> Vec<u8> {
    http_response(status, "text/plain; charset=utf-8", body)
}

fn html_response(body: &str) -> Vec<u8> {
    http_response("200 OK", "text/html; charset=utf-8", body)
}

pub(crate) fn render_success_page(identity: Option<&UserIdentity>) -> String {
    let (email, name) = match identity {
        Some(id) => (escape_html(&id.email), escape_html(&id.display_name)),
        None => (GENERIC_EMAIL.to_string(), GENERIC_NAME.to_string()),
    };
    SUCCESS_PAGE_TEMPLATE
        .replace("{{email}}", &email)
        .replace("{{name}}", &name)
}

pub(crate) fn render_failure_page(message: &str) -> String {
    FAILURE_PAGE_TEMPLATE.replace("{{message}}", &escape_html(message))
}

struct ListenerShared {
    port: u16,
    events: mpsc::Sender<ListenerEvent>,
    page: watch::Receiver<PageOutcome>,
    page_wait: Duration,
    state: Mutex<ListenerState>,
    close_emitted: AtomicBool,
    shutdown: Notify,
}

impl ListenerShared {
    fn set_state(&self, next: ListenerState) {
        let mut state = self.state.lock_or_recover();
        if *state != ListenerState::Closed {
            *state = next;
        }
    }

    async fn emit(&self, event: ListenerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(port = self.port, "listener event dropped: orchestrator gone");
        }
    }

    async fn await_page_outcome(&self) -> PageOutcome {
        let mut rx = self.page.clone();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if current != PageOutcome::Pending {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };
        tokio::time::timeout(self.page_wait, wait)
            .await
            .unwrap_or(PageOutcome::Pending)
    }

    async fn dispatch(&self, request: &str) -> Vec<u8> {
        match route_request(request) {
            Route::BadRequest => {
                tracing::debug!(port = self.port, "oauth callback: rejected malformed request");
                text_response("400 Bad Request", BAD_REQUEST_BODY)
            }
            Route::Placeholder => text_response("200 OK", PLACEHOLDER_BODY),
            Route::Close => {
                let state = *self.state.lock_or_recover();
                if state == ListenerState::Listening {
                    // Usually a success tab left over from an earlier attempt on the same port.
                    tracing::debug!(
                        port = self.port,
                        "oauth callback: close ping before callback ignored"
                    );
                } else if !self.close_emitted.swap(true, Ordering::SeqCst) {
                    tracing::info!(port = self.port, "oauth callback: close ping received");
                    self.emit(ListenerEvent::ReadyToProceed).await;
                    self.set_state(ListenerState::Closed);
                    self.shutdown.notify_one();
                } else {
                    tracing::debug!(port = self.port, "oauth callback: repeated close ping ignored");
                }
                text_response("200 OK", "OK")
            }
            Route::Callback(params) => {
                let has_code = params.contains("code");
                tracing::info!(
                    port = self.port,
                    has_code,
                    params = params.len(),
                    "oauth callback received"
                );
                self.set_state(ListenerState::CallbackReceived);
                self.emit(ListenerEvent::CallbackReceived(params)).await;

                if !has_code {
                    return text_response("200 OK", ERROR_ACK_BODY);
                }
                match self.await_page_outcome().await {
                    PageOutcome::Identity(identity) => {
                        html_response(&render_success_page(Some(&identity)))
                    }
                    PageOutcome::Failed(message) => html_response(&render_failure_page(&message)),
                    PageOutcome::Pending => html_response(&render_success_page(None)),
                }
            }
        }
    }
}

async fn read_request_head(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; MAX_REQUEST_HEAD_BYTES];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = socket.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buffer[..filled].contains(&b'\n') {
            break;
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, shared: Arc<ListenerShared>) {
    let head = match tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut socket)).await {
        Ok(Ok(head)) if !head.is_empty() => head,
        Ok(Ok(_)) => return,
        Ok(Err(err)) => {
            tracing::debug!(%peer, "oauth callback read failed: {err}");
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "oauth callback read timed out");
            return;
        }
    };

    let request = String::from_utf8_lossy(&head);
    let response = shared.dispatch(request.as_ref()).await;
    if let Err(err) = socket.write_all(&response).await {
        tracing::debug!(%peer, "oauth callback write failed: {err}");
    }
    let _ = socket.shutdown().await;
}

#[derive(Debug)]
pub(crate) struct BoundCallbackSockets {
    port: u16,
    listener_v4: Option<TcpListener>,
    listener_v6: Option<TcpListener>,
}

impl BoundCallbackSockets {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match (self.listener_v4.as_ref(), self.listener_v6.as_ref()) {
            (Some(v4), Some(v6)) => {
                tokio::select! {
                    result = v4.accept() => result,
                    result = v6.accept() => result,
                }
            }
            (Some(v4), None) => v4.accept().await,
            (None, Some(v6)) => v6.accept().await,
            (None, None) => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no bound loopback socket",
            )),
        }
    }
}

/// Binds the preferred port on both loopback families, falling back to an OS-assigned port.
pub(crate) async fn bind_callback_sockets(preferred_port: u16) -> AppResult<BoundCallbackSockets> {
    match try_bind_on_port(preferred_port).await {
        Ok(bound) => Ok(bound),
        Err(preferred_err) if preferred_port == 0 => Err(AppError::new(
            SYSTEM_ERROR,
            format!("oauth callback bind failed: {preferred_err}"),
        )),
        Err(preferred_err) => {
            tracing::warn!(
                preferred_port,
                "oauth callback port unavailable, falling back to a dynamic port: {preferred_err}"
            );
            try_bind_dynamic_port().await.map_err(|fallback_err| {
                AppError::new(
                    SYSTEM_ERROR,
                    format!(
                        "oauth callback bind failed: {preferred_err}; fallback_dynamic_port: {fallback_err}"
                    ),
                )
            })
        }
    }
}

const LOOPBACK_V4: &str = "127.0.0.1";
const LOOPBACK_V6: &str = "::1";

async fn bind_one(host: &str, port: u16, errors: &mut Vec<String>) -> Option<TcpListener> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => Some(listener),
        Err(err) => {
            errors.push(format!("{host}:{port} ({err})"));
            None
        }
    }
}

async fn try_bind_on_port(port: u16) -> Result<BoundCallbackSockets, String> {
    if port == 0 {
        return try_bind_dynamic_port().await;
    }

    let mut bind_errors = Vec::new();
    let listener_v4 = bind_one(LOOPBACK_V4, port, &mut bind_errors).await;
    let listener_v6 = bind_one(LOOPBACK_V6, port, &mut bind_errors).await;
    if listener_v4.is_none() && listener_v6.is_none() {
        return Err(bind_errors.join("; "));
    }
    Ok(BoundCallbackSockets {
        port,
        listener_v4,
        listener_v6,
    })
}

async fn try_bind_dynamic_port() -> Result<BoundCallbackSockets, String> {
    let mut bind_errors = Vec::new();

    for (primary, secondary) in [(LOOPBACK_V4, LOOPBACK_V6), (LOOPBACK_V6, LOOPBACK_V4)] {
        let Some(first) = bind_one(primary, 0, &mut bind_errors).await else {
            continue;
        };
        let port = first
            .local_addr()
            .map_err(|e| format!("{primary}:0 (local_addr failed: {e})"))?
            .port();
        // The sibling family is best-effort; one loopback socket is enough to serve the redirect.
        let second = bind_one(secondary, port, &mut bind_errors).await;
        let (listener_v4, listener_v6) = if primary == LOOPBACK_V4 {
            (Some(first), second)
        } else {
            (second, Some(first))
        };
        return Ok(BoundCallbackSockets {
            port,
            listener_v4,
            listener_v6,
        });
    }

    Err(bind_errors.join("; "))
}

/// One listener per login attempt. Dropping it closes the sockets.
pub(crate) struct CallbackListener {
    shared: Arc<ListenerShared>,
    page: PagePublisher,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    pub(crate) async fn start(
        preferred_port: u16,
        page_wait: Duration,
        events: mpsc::Sender<ListenerEvent>,
    ) -> AppResult<Self> {
        let sockets = bind_callback_sockets(preferred_port).await?;
        Ok(Self::serve(sockets, page_wait, events))
    }

    pub(crate) fn serve(
        sockets: BoundCallbackSockets,
        page_wait: Duration,
        events: mpsc::Sender<ListenerEvent>,
    ) -> Self {
        let (page_tx, page_rx) = watch::channel(PageOutcome::Pending);
        let shared = Arc::new(ListenerShared {
            port: sockets.port(),
            events,
            page: page_rx,
            page_wait,
            state: Mutex::new(ListenerState::Listening),
            close_emitted: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        tracing::info!(
            port = sockets.port(),
            v4 = sockets.listener_v4.is_some(),
            v6 = sockets.listener_v6.is_some(),
            "oauth callback listener started"
        );
        let task = tokio::spawn(accept_loop(sockets, shared.clone()));
        Self {
            shared,
            page: PagePublisher {
                tx: Arc::new(page_tx),
            },
            task: Some(task),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.shared.port
    }

    pub(crate) fn redirect_uri(&self) -> String {
        make_redirect_uri(self.port())
    }

    pub(crate) fn state(&self) -> ListenerState {
        *self.shared.state.lock_or_recover()
    }

    pub(crate) fn page_publisher(&self) -> PagePublisher {
        self.page.clone()
    }

    /// Stops accepting and waits until the sockets are released.
    pub(crate) async fn shutdown(mut self) {
        self.shared.set_state(ListenerState::Closed);
        self.shared.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shared.set_state(ListenerState::Closed);
            self.shared.shutdown.notify_one();
            task.abort();
        }
    }
}

async fn accept_loop(sockets: BoundCallbackSockets, shared: Arc<ListenerShared>) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.notified() => break,
            result = sockets.accept() => result,
        };
        match accepted {
            Ok((socket, peer)) => {
                tokio::spawn(handle_connection(socket, peer, shared.clone()));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => break,
            Err(err) => {
                tracing::warn!(port = shared.port, "oauth callback accept failed: {err}");
            }
        }
    }
    shared.set_state(ListenerState::Closed);
    tracing::info!(port = shared.port, "oauth callback listener closed");
}

const FAILURE_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Login Failed - CRM</title>
    <style>
        body { font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; background: #f4f4f8;
               min-height: 100vh; display: flex; align-items: center; justify-content: center; margin: 0; }
        .card { background: #fff; border-radius: 16px; padding: 48px 36px; max-width: 480px; width: 90%;
                text-align: center; box-shadow: 0 20px 40px rgba(0, 0, 0, 0.12); }
        h1 { color: #c0392b; font-size: 28px; margin-bottom: 16px; }
        p { color: #555; line-height: 1.6; }
        code { display: block; margin-top: 16px; color: #2c3e50; word-break: break-word; }
    </style>
</head>
<body>
    <div class="card">
        <h1>Authentication Failed</h1>
        <p>The CRM application could not complete your login. Close this window and try again.</p>
        <code>{{message}}</code>
    </div>
</body>
</html>
"#;

const SUCCESS_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Login Successful - CRM Access Granted</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
            min-height: 100vh; display: flex; align-items: center; justify-content: center;
        }
        .success-container {
            background: rgba(255, 255, 255, 0.95); border-radius: 20px; padding: 60px 40px;
            max-width: 500px; width: 90%; text-align: center;
            box-shadow: 0 25px 50px rgba(0, 0, 0, 0.2);
            animation: slideIn 0.8s cubic-bezier(0.175, 0.885, 0.32, 1.275);
        }
        .success-icon {
            width: 100px; height: 100px; margin: 0 auto 30px; border-radius: 50%;
            background: linear-gradient(135deg, #4CAF50, #45a049);
            display: flex; align-items: center; justify-content: center;
            color: white; font-size: 56px;
        }
        .success-title { color: #2c3e50; font-size: 32px; font-weight: 700; margin-bottom: 15px; }
        .success-message { color: #555; font-size: 18px; margin-bottom: 30px; line-height: 1.6; }
        .user-info {
            background: linear-gradient(135deg, #f8f9fa, #e9ecef); margin: 30px 0; padding: 25px;
            border-radius: 15px; border: 1px solid rgba(0, 0, 0, 0.1);
        }
        .user-email { font-size: 18px; font-weight: 600; color: #2c3e50; margin-bottom: 8px; }
        .user-name { font-size: 16px; color: #666; font-weight: 500; }
        .continue-button {
            background: linear-gradient(135deg, #4CAF50, #45a049); color: white; border: none;
            padding: 15px 40px; font-size: 16px; font-weight: 600; border-radius: 50px; cursor: pointer;
        }
        @keyframes slideIn {
            0% { opacity: 0; transform: translateY(50px) scale(0.8); }
            100% { opacity: 1; transform: translateY(0) scale(1); }
        }
    </style>
</head>
<body>
    <div class="success-container">
        <div class="success-icon">&#10003;</div>
        <h1 class="success-title">Authentication Successful!</h1>
        <p class="success-message">Welcome to CRM System! Your login credentials have been verified successfully.</p>
        <div class="user-info">
            <div class="user-email">{{email}}</div>
            <div class="user-name">{{name}}</div>
        </div>
        <button class="continue-button" onclick="proceedToApplication()">Launch CRM Dashboard</button>
    </div>
    <script>
        function proceedToApplication() {
            fetch('/close')
                .then(() => { window.close(); })
                .catch(() => { window.close(); });
        }
        document.addEventListener('keydown', function (e) {
            if (e.key === 'Enter' || e.key === ' ') {
                proceedToApplication();
            }
        });
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_test(page_wait: Duration) -> (Arc<ListenerShared>, PagePublisher, mpsc::Receiver<ListenerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (page_tx, page_rx) = watch::channel(PageOutcome::Pending);
        let shared = Arc::new(ListenerShared {
            port: 0,
            events: events_tx,
            page: page_rx,
            page_wait,
            state: Mutex::new(ListenerState::Listening),
            close_emitted: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        (
            shared,
            PagePublisher {
                tx: Arc::new(page_tx),
            },
            events_rx,
        )
    }

    fn body_of(response: &[u8]) -> String {
        let text = String::from_utf8_lossy(response).to_string();
        text.split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn route_extracts_code_and_state() {
        let route = route_request("GET /?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let Route::Callback(params) = route else {
            panic!("expected callback route");
        };
        assert_eq!(params.get("code"), Some("abc123"));
        assert_eq!(params.get("state"), Some("xyz"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn route_decodes_plus_and_percent_escapes() {
        let route = route_request(
            "GET /?error=access_denied&error_description=User+cancelled%21 HTTP/1.1\r\n\r\n",
        );
        let Route::Callback(params) = route else {
            panic!("expected callback route");
        };
        assert_eq!(params.get("error"), Some("access_denied"));
        assert_eq!(params.get("error_description"), Some("User cancelled!"));
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let parsed = parse_request_target("/?code=first&state=s&code=second").expect("target");
        assert_eq!(parsed.params.get("code"), Some("second"));
        let keys: Vec<&str> = parsed.params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["code", "state"]);
    }

    #[test]
    fn keys_are_case_sensitive() {
        assert_eq!(
            route_request("GET /?Code=abc HTTP/1.1\r\n\r\n"),
            Route::Placeholder
        );
    }

    #[test]
    fn close_path_routes_to_close() {
        assert_eq!(route_request("GET /close HTTP/1.1\r\n\r\n"), Route::Close);
    }

    #[test]
    fn requests_without_code_or_error_get_placeholder() {
        assert_eq!(
            route_request("GET /favicon.ico HTTP/1.1\r\n\r\n"),
            Route::Placeholder
        );
        assert_eq!(route_request("GET /?foo=bar HTTP/1.1\r\n\r\n"), Route::Placeholder);
    }

    #[test]
    fn non_get_and_malformed_lines_are_rejected() {
        assert_eq!(route_request("POST /?code=x HTTP/1.1\r\n\r\n"), Route::BadRequest);
        assert_eq!(route_request("GET\r\n\r\n"), Route::BadRequest);
        assert_eq!(route_request("GET nopath HTTP/1.1\r\n"), Route::BadRequest);
        assert_eq!(route_request(""), Route::BadRequest);
    }

    #[test]
    fn success_page_escapes_identity() {
        let identity = UserIdentity {
            email: "a@b.com".to_string(),
            display_name: "<script>x</script>".to_string(),
        };
        let html = render_success_page(Some(&identity));
        assert!(html.contains("a@b.com"));
        assert!(html.contains("&lt;script&gt;x&lt;/script&gt;"));
        assert!(html.contains("fetch('/close')"));
    }

    #[test]
    fn responses_carry_required_headers() {
        let response = String::from_utf8(html_response("<p>hi</p>")).expect("utf8");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains("Cache-Control: no-cache\r\n"));
        assert!(response.contains("Content-Length: 9\r\n"));
    }

    #[tokio::test]
    async fn code_callback_emits_event_and_renders_identity() {
        let (shared, page, mut events) = shared_for_test(Duration::from_secs(5));
        page.publish(PageOutcome::Identity(UserIdentity {
            email: "a@b.com".to_string(),
            display_name: "A B".to_string(),
        }));

        let response = shared.dispatch("GET /?code=abc123&state=xyz HTTP/1.1\r\n\r\n").await;
        let body = body_of(&response);
        assert!(body.contains("Authentication Successful!"));
        assert!(body.contains("a@b.com"));

        let event = events.recv().await.expect("event");
        let ListenerEvent::CallbackReceived(params) = event else {
            panic!("expected callback event");
        };
        assert_eq!(params.get("code"), Some("abc123"));
        assert_eq!(*shared.state.lock_or_recover(), ListenerState::CallbackReceived);
    }

    #[tokio::test]
    async fn code_callback_falls_back_to_generic_page_after_wait() {
        let (shared, _page, _events) = shared_for_test(Duration::from_millis(20));
        let response = shared.dispatch("GET /?code=abc HTTP/1.1\r\n\r\n").await;
        let body = body_of(&response);
        assert!(body.contains("Authentication Successful!"));
        assert!(body.contains(GENERIC_EMAIL));
    }

    #[tokio::test]
    async fn code_callback_renders_failure_when_exchange_failed() {
        let (shared, page, _events) = shared_for_test(Duration::from_secs(5));
        page.publish(PageOutcome::Failed("AUTH_MISSING_TOKEN: no token".to_string()));
        let body = body_of(&shared.dispatch("GET /?code=abc HTTP/1.1\r\n\r\n").await);
        assert!(body.contains("Authentication Failed"));
        assert!(body.contains("AUTH_MISSING_TOKEN"));
    }

    #[tokio::test]
    async fn error_callback_gets_plain_acknowledgement() {
        let (shared, _page, mut events) = shared_for_test(Duration::from_secs(5));
        let response = shared
            .dispatch("GET /?error=access_denied HTTP/1.1\r\n\r\n")
            .await;
        let text = String::from_utf8_lossy(&response).to_string();
        assert!(text.contains("Content-Type: text/plain"));
        assert_eq!(body_of(&response), ERROR_ACK_BODY);
        assert!(matches!(
            events.recv().await,
            Some(ListenerEvent::CallbackReceived(_))
        ));
    }

    #[tokio::test]
    async fn close_ping_emits_ready_exactly_once() {
        let (shared, _page, mut events) = shared_for_test(Duration::from_secs(5));
        shared.set_state(ListenerState::CallbackReceived);
        let first = shared.dispatch("GET /close HTTP/1.1\r\n\r\n").await;
        let second = shared.dispatch("GET /close HTTP/1.1\r\n\r\n").await;
        assert!(String::from_utf8_lossy(&first).starts_with("HTTP/1.1 200 OK"));
        assert!(String::from_utf8_lossy(&second).starts_with("HTTP/1.1 200 OK"));

        assert_eq!(events.recv().await, Some(ListenerEvent::ReadyToProceed));
        assert!(events.try_recv().is_err());
        assert_eq!(*shared.state.lock_or_recover(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn close_ping_before_callback_keeps_listening() {
        let (shared, _page, mut events) = shared_for_test(Duration::from_secs(5));
        let early = shared.dispatch("GET /close HTTP/1.1\r\n\r\n").await;
        assert!(String::from_utf8_lossy(&early).starts_with("HTTP/1.1 200 OK"));
        assert!(events.try_recv().is_err());
        assert_eq!(*shared.state.lock_or_recover(), ListenerState::Listening);
        assert!(!shared.close_emitted.load(Ordering::SeqCst));

        shared.set_state(ListenerState::CallbackReceived);
        shared.dispatch("GET /close HTTP/1.1\r\n\r\n").await;
        assert_eq!(events.recv().await, Some(ListenerEvent::ReadyToProceed));
        assert_eq!(*shared.state.lock_or_recover(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn placeholder_does_not_change_state_or_emit() {
        let (shared, _page, mut events) = shared_for_test(Duration::from_secs(5));
        let body = body_of(&shared.dispatch("GET /favicon.ico HTTP/1.1\r\n\r\n").await);
        assert_eq!(body, PLACEHOLDER_BODY);
        assert!(events.try_recv().is_err());
        assert_eq!(*shared.state.lock_or_recover(), ListenerState::Listening);
    }

    #[tokio::test]
    async fn busy_preferred_port_falls_back_to_dynamic_port() {
        let blocker = TcpListener::bind((LOOPBACK_V4, 0)).await.expect("blocker");
        let busy_port = blocker.local_addr().expect("addr").port();
        let _blocker_v6 = TcpListener::bind((LOOPBACK_V6, busy_port)).await.ok();

        let bound = bind_callback_sockets(busy_port).await.expect("fallback bind");
        assert_ne!(bound.port(), busy_port);
        assert_ne!(bound.port(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let listener = CallbackListener::start(0, Duration::from_millis(10), events_tx)
            .await
            .expect("start");
        let port = listener.port();
        assert_eq!(listener.redirect_uri(), format!("http://localhost:{port}/"));
        assert_eq!(listener.state(), ListenerState::Listening);
        listener.shutdown().await;

        let rebound = TcpListener::bind((LOOPBACK_V4, port)).await;
        assert!(rebound.is_ok(), "port {port} should be free after shutdown");
    }
}
