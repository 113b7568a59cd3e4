//! Usage: Drives one PKCE authorization-code attempt end-to-end.
//!
//! Each attempt owns a fresh [`CallbackListener`] and PKCE pair. A driver task consumes listener
//! events in order (callback, token exchange, profile fetch, close ping) and reports exactly one
//! terminal outcome to the [`FlowObserver`], unless the attempt is torn down first.

use crate::infra::settings::LoginSettings;
use crate::shared::error::{
    AppError, AppResult, AUTH_CANCELLED, AUTH_EMPTY_CODE, AUTH_PROVIDER_ERROR, AUTH_TIMEOUT,
    SEC_INVALID_INPUT, SYSTEM_ERROR,
};
use crate::shared::security::constant_time_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::browser::BrowserOpener;
use super::callback_server::{
    CallbackListener, CallbackParams, ListenerEvent, PageOutcome, PagePublisher,
};
use super::pkce::{generate_pkce_pair, generate_state};
use super::providers::{build_authorize_url, OAuthProviderConfig};
use super::token_exchange::{exchange_authorization_code, join_error, TokenExchangeRequest};
use super::userinfo::{fetch_user_identity, UserIdentity};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Receives the single terminal outcome of an attempt. Called from the driver task.
pub trait FlowObserver: Send + Sync + 'static {
    fn on_success(&self, identity: UserIdentity);
    fn on_failure(&self, message: String);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStarted {
    pub attempt: u64,
    pub auth_url: String,
    pub redirect_uri: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Teardown,
    Cancel,
}

struct ActiveAttempt {
    id: u64,
    port: u16,
    stop: Option<oneshot::Sender<StopReason>>,
    finished: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl ActiveAttempt {
    async fn stop(mut self, reason: StopReason) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(reason);
        }
        if let Err(err) = (&mut self.driver).await {
            if err.is_panic() {
                tracing::error!(attempt = self.id, "oauth attempt driver panicked");
            }
        }
    }
}

struct AttemptContext {
    id: u64,
    http: reqwest::Client,
    token_url: String,
    userinfo_url: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    code_verifier: String,
    state: String,
    callback_timeout: Option<Duration>,
    close_ping_timeout: Option<Duration>,
}

pub struct AuthorizationFlow {
    provider: OAuthProviderConfig,
    http: reqwest::Client,
    opener: Arc<dyn BrowserOpener>,
    page_wait: Duration,
    callback_timeout: Option<Duration>,
    close_ping_timeout: Option<Duration>,
    next_attempt: u64,
    attempt: Option<ActiveAttempt>,
}

pub(crate) fn oauth_http_client(connect_timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("crm-login/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| AppError::with_source(SYSTEM_ERROR, format!("oauth client init failed: {e}"), e))
}

impl AuthorizationFlow {
    pub fn new(settings: &LoginSettings, opener: Arc<dyn BrowserOpener>) -> AppResult<Self> {
        Ok(Self {
            provider: OAuthProviderConfig::from_settings(settings),
            http: oauth_http_client(settings.http_connect_timeout())?,
            opener,
            page_wait: settings.page_identity_wait(),
            callback_timeout: settings.callback_timeout(),
            close_ping_timeout: settings.close_ping_timeout(),
            next_attempt: 1,
            attempt: None,
        })
    }

    /// Replaces any previous attempt, binds a fresh listener and opens the browser.
    ///
    /// The returned URL is the one handed to the browser; callers may show it for manual
    /// navigation. A bind failure is returned here and no observer callback fires.
    pub async fn start(&mut self, observer: Arc<dyn FlowObserver>) -> AppResult<LoginStarted> {
        self.teardown().await;

        let attempt_id = self.next_attempt;
        self.next_attempt += 1;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let listener = CallbackListener::start(
            self.provider.default_callback_port,
            self.page_wait,
            events_tx,
        )
        .await?;
        let port = listener.port();
        let redirect_uri = listener.redirect_uri();

        let pkce = generate_pkce_pair();
        let state = generate_state();
        let auth_url =
            match build_authorize_url(&self.provider, &redirect_uri, &state, &pkce.code_challenge) {
                Ok(url) => url,
                Err(err) => {
                    listener.shutdown().await;
                    return Err(err);
                }
            };

        let ctx = AttemptContext {
            id: attempt_id,
            http: self.http.clone(),
            token_url: self.provider.token_url.clone(),
            userinfo_url: self.provider.userinfo_url.clone(),
            client_id: self.provider.client_id.clone(),
            client_secret: self.provider.client_secret.clone(),
            redirect_uri: redirect_uri.clone(),
            code_verifier: pkce.code_verifier,
            state,
            callback_timeout: self.callback_timeout,
            close_ping_timeout: self.close_ping_timeout,
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive_attempt(
            ctx,
            listener,
            events_rx,
            stop_rx,
            finished.clone(),
            observer,
        ));
        self.attempt = Some(ActiveAttempt {
            id: attempt_id,
            port,
            stop: Some(stop_tx),
            finished,
            driver,
        });

        tracing::info!(attempt = attempt_id, port, "oauth login attempt started");
        if let Err(err) = self.opener.open(&auth_url) {
            tracing::warn!(
                attempt = attempt_id,
                "failed to open browser, continue manually with the authorization url: {err}"
            );
        }

        Ok(LoginStarted {
            attempt: attempt_id,
            auth_url,
            redirect_uri,
            port,
        })
    }

    /// Ends the current attempt without an observer callback and releases its socket.
    pub async fn teardown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            tracing::debug!(attempt = attempt.id, "oauth attempt teardown");
            attempt.stop(StopReason::Teardown).await;
        }
    }

    /// Ends the current attempt with an `AUTH_CANCELLED` failure unless it already finished.
    pub async fn cancel(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            tracing::info!(attempt = attempt.id, "oauth attempt cancelled");
            attempt.stop(StopReason::Cancel).await;
        }
    }

    /// True while the current attempt has not yet reported an outcome.
    pub fn is_active(&self) -> bool {
        self.attempt.as_ref().is_some_and(|attempt| {
            !attempt.finished.load(Ordering::SeqCst) && !attempt.driver.is_finished()
        })
    }

    /// Port of the listener held by the current attempt, including a failed one not yet replaced.
    pub fn port(&self) -> Option<u16> {
        self.attempt.as_ref().map(|attempt| attempt.port)
    }
}

async fn drive_attempt(
    ctx: AttemptContext,
    listener: CallbackListener,
    mut events: mpsc::Receiver<ListenerEvent>,
    mut stop: oneshot::Receiver<StopReason>,
    finished: Arc<AtomicBool>,
    observer: Arc<dyn FlowObserver>,
) {
    let page = listener.page_publisher();
    let mut stopped = true;
    let outcome = tokio::select! {
        biased;
        reason = &mut stop => match reason {
            Ok(StopReason::Cancel) => Some(Err(AppError::new(AUTH_CANCELLED, "Login cancelled"))),
            Ok(StopReason::Teardown) | Err(_) => None,
        },
        result = run_attempt(&ctx, &page, &mut events) => {
            stopped = false;
            Some(result)
        }
    };
    finished.store(true, Ordering::SeqCst);

    match outcome {
        Some(Ok(identity)) => {
            tracing::info!(attempt = ctx.id, email = %identity.email, "oauth login succeeded");
            observer.on_success(identity);
        }
        Some(Err(err)) => {
            page.publish(PageOutcome::Failed(err.to_string()));
            tracing::warn!(attempt = ctx.id, code = err.code(), "oauth login failed: {err}");
            observer.on_failure(err.to_string());

            // A failed attempt keeps its socket until teardown, cancel, the next start or drop.
            if !stopped {
                let _ = (&mut stop).await;
            }
        }
        None => tracing::debug!(attempt = ctx.id, "oauth attempt dropped before completion"),
    }

    tracing::debug!(attempt = ctx.id, listener = ?listener.state(), "releasing oauth callback listener");
    listener.shutdown().await;
}

async fn run_attempt(
    ctx: &AttemptContext,
    page: &PagePublisher,
    events: &mut mpsc::Receiver<ListenerEvent>,
) -> AppResult<UserIdentity> {
    let params = wait_for_callback(ctx, events).await?;
    let code = validate_callback(&params, &ctx.state)?;

    let token = exchange_authorization_code(
        &ctx.http,
        &TokenExchangeRequest {
            token_uri: ctx.token_url.clone(),
            client_id: ctx.client_id.clone(),
            client_secret: ctx.client_secret.clone(),
            code,
            redirect_uri: ctx.redirect_uri.clone(),
            code_verifier: ctx.code_verifier.clone(),
        },
    )
    .await?;

    let identity = fetch_user_identity(&ctx.http, &ctx.userinfo_url, &token.access_token).await?;
    page.publish(PageOutcome::Identity(identity.clone()));

    wait_for_close_ping(ctx, events).await;
    Ok(identity)
}

async fn wait_for_callback(
    ctx: &AttemptContext,
    events: &mut mpsc::Receiver<ListenerEvent>,
) -> AppResult<CallbackParams> {
    let wait = async {
        loop {
            match events.recv().await {
                Some(ListenerEvent::CallbackReceived(params)) => return Ok(params),
                Some(ListenerEvent::ReadyToProceed) => {
                    tracing::debug!(attempt = ctx.id, "ignoring close ping before the callback");
                }
                None => {
                    return Err(AppError::new(
                        SYSTEM_ERROR,
                        "oauth callback listener stopped before the redirect arrived",
                    ))
                }
            }
        }
    };

    match ctx.callback_timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            AppError::new(
                AUTH_TIMEOUT,
                format!(
                    "No authorization callback received within {}s",
                    limit.as_secs()
                ),
            )
        })?,
        None => wait.await,
    }
}

async fn wait_for_close_ping(ctx: &AttemptContext, events: &mut mpsc::Receiver<ListenerEvent>) {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ListenerEvent::ReadyToProceed => return,
                ListenerEvent::CallbackReceived(_) => {
                    tracing::debug!(attempt = ctx.id, "ignoring repeated oauth callback");
                }
            }
        }
    };

    match ctx.close_ping_timeout {
        Some(limit) => {
            if tokio::time::timeout(limit, wait).await.is_err() {
                tracing::warn!(
                    attempt = ctx.id,
                    waited_secs = limit.as_secs(),
                    "success page was not acknowledged, completing login anyway"
                );
            }
        }
        None => wait.await,
    }
}

/// Returns the authorization code, or the failure the callback describes.
pub(crate) fn validate_callback(params: &CallbackParams, expected_state: &str) -> AppResult<String> {
    if let Some(error) = params.get("error") {
        let code = Some(error.trim().to_string()).filter(|v| !v.is_empty());
        let detail = params
            .get("error_description")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        return Err(AppError::new(AUTH_PROVIDER_ERROR, join_error(code, detail)));
    }

    match params.get("state") {
        Some(state) if !constant_time_eq(state.as_bytes(), expected_state.as_bytes()) => {
            return Err(AppError::new(SEC_INVALID_INPUT, "OAuth state mismatch"));
        }
        Some(_) => {}
        None => tracing::warn!("oauth callback carried no state parameter"),
    }

    params
        .get("code")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::new(AUTH_EMPTY_CODE, "Empty authorization code received"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> CallbackParams {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn code_with_matching_state_is_accepted() {
        let code = validate_callback(&params(&[("code", "abc123"), ("state", "s1")]), "s1")
            .expect("code");
        assert_eq!(code, "abc123");
    }

    #[test]
    fn missing_state_is_tolerated() {
        let code = validate_callback(&params(&[("code", "abc123")]), "s1").expect("code");
        assert_eq!(code, "abc123");
    }

    #[test]
    fn state_mismatch_is_rejected() {
        let err = validate_callback(&params(&[("code", "abc"), ("state", "other")]), "s1")
            .expect_err("should fail");
        assert_eq!(err.code(), SEC_INVALID_INPUT);
    }

    #[test]
    fn provider_error_combines_error_and_description() {
        let err = validate_callback(
            &params(&[("error", "access_denied"), ("error_description", "User denied")]),
            "s1",
        )
        .expect_err("should fail");
        assert_eq!(err.code(), AUTH_PROVIDER_ERROR);
        assert_eq!(err.to_string(), "AUTH_PROVIDER_ERROR: access_denied - User denied");
    }

    #[test]
    fn error_takes_precedence_over_code() {
        let err = validate_callback(&params(&[("code", "abc"), ("error", "server_error")]), "s1")
            .expect_err("should fail");
        assert_eq!(err.message(), "server_error");
    }

    #[test]
    fn empty_code_is_a_failure() {
        let err = validate_callback(&params(&[("code", ""), ("state", "s1")]), "s1")
            .expect_err("should fail");
        assert_eq!(err.code(), AUTH_EMPTY_CODE);
        assert_eq!(err.message(), "Empty authorization code received");
    }

    struct NoBrowser;

    impl BrowserOpener for NoBrowser {
        fn open(&self, _url: &str) -> AppResult<()> {
            Ok(())
        }
    }

    struct Outcomes(mpsc::UnboundedSender<Result<String, String>>);

    impl FlowObserver for Outcomes {
        fn on_success(&self, identity: UserIdentity) {
            let _ = self.0.send(Ok(identity.email));
        }

        fn on_failure(&self, message: String) {
            let _ = self.0.send(Err(message));
        }
    }

    async fn send_request(port: u16, request: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read");
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn failed_attempt_holds_listener_until_teardown() {
        let settings = LoginSettings {
            preferred_callback_port: 0,
            ..LoginSettings::default()
        };
        let mut flow = AuthorizationFlow::new(&settings, Arc::new(NoBrowser)).expect("flow");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = flow.start(Arc::new(Outcomes(tx))).await.expect("start");
        assert!(flow.is_active());

        send_request(started.port, "GET /?error=access_denied HTTP/1.1\r\n\r\n").await;
        let outcome = rx.recv().await.expect("outcome");
        assert_eq!(outcome, Err("AUTH_PROVIDER_ERROR: access_denied".to_string()));

        assert!(!flow.is_active());
        assert_eq!(flow.port(), Some(started.port));
        let response = send_request(started.port, "GET /favicon.ico HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        flow.cancel().await;
        assert!(rx.try_recv().is_err(), "no second outcome after cancel");
        assert!(flow.port().is_none());
        let rebound = tokio::net::TcpListener::bind(("127.0.0.1", started.port)).await;
        assert!(rebound.is_ok(), "port should be free after cancel");
    }
}
