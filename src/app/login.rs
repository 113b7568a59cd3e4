//! Usage: Login façade used by the host UI (OAuth browser login plus local credential fallback).

use crate::infra::settings::LoginSettings;
use crate::oauth::browser::BrowserOpener;
use crate::oauth::flow::{AuthorizationFlow, FlowObserver, LoginStarted};
use crate::oauth::userinfo::UserIdentity;
use crate::shared::error::{AppError, AppResult, SEC_INVALID_INPUT, SYSTEM_ERROR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    InProgress,
    Succeeded(UserIdentity),
    Failed(String),
}

impl LoginState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::Succeeded(_) | LoginState::Failed(_))
    }
}

/// What `submit` did with the entered credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginSubmission {
    Local(UserIdentity),
    OAuth(LoginStarted),
}

/// Forwards one attempt's outcome into the façade state, unless a newer attempt replaced it.
struct StatePublisher {
    tx: Arc<watch::Sender<LoginState>>,
    generation: Arc<AtomicU64>,
    attempt: u64,
}

impl StatePublisher {
    fn publish(&self, next: LoginState) {
        let published = self.tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != self.attempt {
                return false;
            }
            *state = next;
            true
        });
        if !published {
            tracing::debug!(attempt = self.attempt, "ignoring outcome of a replaced login attempt");
        }
    }
}

impl FlowObserver for StatePublisher {
    fn on_success(&self, identity: UserIdentity) {
        self.publish(LoginState::Succeeded(identity));
    }

    fn on_failure(&self, message: String) {
        self.publish(LoginState::Failed(message));
    }
}

pub struct LoginFacade {
    flow: AuthorizationFlow,
    local_email_domain: String,
    state: Arc<watch::Sender<LoginState>>,
    generation: Arc<AtomicU64>,
}

impl LoginFacade {
    pub fn new(settings: &LoginSettings, opener: Arc<dyn BrowserOpener>) -> AppResult<Self> {
        let (tx, _rx) = watch::channel(LoginState::Idle);
        Ok(Self {
            flow: AuthorizationFlow::new(settings, opener)?,
            local_email_domain: settings.local_login_email_domain.clone(),
            state: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Moves to `next` and retires every earlier attempt's publisher in the same step.
    fn replace_state(&self, next: LoginState) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = next;
        });
        generation
    }

    fn publisher(&self, attempt: u64) -> StatePublisher {
        StatePublisher {
            tx: self.state.clone(),
            generation: self.generation.clone(),
            attempt,
        }
    }

    /// Starts a browser login, replacing whatever attempt was running.
    pub async fn start_login(&mut self) -> AppResult<LoginStarted> {
        let attempt = self.replace_state(LoginState::InProgress);
        let observer = Arc::new(self.publisher(attempt));
        match self.flow.start(observer.clone()).await {
            Ok(started) => Ok(started),
            Err(err) => {
                tracing::warn!("oauth login could not start: {err}");
                observer.publish(LoginState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Both fields filled: local login. Anything else: browser login.
    pub async fn submit(&mut self, username: &str, password: &str) -> AppResult<LoginSubmission> {
        if !username.trim().is_empty() && !password.is_empty() {
            return self
                .login_with_credentials(username, password)
                .await
                .map(LoginSubmission::Local);
        }
        self.start_login().await.map(LoginSubmission::OAuth)
    }

    pub async fn login_with_credentials(
        &mut self,
        username: &str,
        password: &str,
    ) -> AppResult<UserIdentity> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AppError::new(
                SEC_INVALID_INPUT,
                "username and password are required",
            ));
        }

        self.flow.teardown().await;
        let identity = local_identity(username, &self.local_email_domain);
        tracing::info!(email = %identity.email, "local login accepted");
        self.replace_state(LoginState::Succeeded(identity.clone()));
        Ok(identity)
    }

    /// Aborts a running browser login; the state becomes `Failed` with `AUTH_CANCELLED`.
    pub async fn cancel(&mut self) {
        self.flow.cancel().await;
    }

    /// Resolves once the current attempt reaches a terminal state.
    pub async fn wait_for_outcome(&self) -> AppResult<UserIdentity> {
        let mut rx = self.state.subscribe();
        if *rx.borrow() == LoginState::Idle {
            return Err(AppError::new(SEC_INVALID_INPUT, "no login attempt in progress"));
        }
        let terminal = rx
            .wait_for(LoginState::is_terminal)
            .await
            .map_err(|_| AppError::new(SYSTEM_ERROR, "login state channel closed"))?
            .clone();
        match terminal {
            LoginState::Succeeded(identity) => Ok(identity),
            LoginState::Failed(message) => Err(AppError::from(message)),
            LoginState::Idle | LoginState::InProgress => Err(AppError::new(
                SYSTEM_ERROR,
                "login ended without an outcome",
            )),
        }
    }

    pub fn state(&self) -> LoginState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoginState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        match &*self.state.borrow() {
            LoginState::Succeeded(identity) => Some(identity.clone()),
            _ => None,
        }
    }

    pub fn email(&self) -> Option<String> {
        self.identity().map(|identity| identity.email)
    }

    pub fn display_name(&self) -> Option<String> {
        self.identity().map(|identity| identity.display_name)
    }

    /// The login button stays disabled while a browser login is in flight.
    pub fn can_retry(&self) -> bool {
        !matches!(*self.state.borrow(), LoginState::InProgress)
    }

    pub fn callback_port(&self) -> Option<u16> {
        self.flow.port()
    }
}

pub(crate) fn local_identity(username: &str, domain: &str) -> UserIdentity {
    let email = if username.contains('@') {
        username.to_string()
    } else {
        format!("{username}@{domain}")
    };
    UserIdentity {
        email,
        display_name: username.to_string(),
    }
}
