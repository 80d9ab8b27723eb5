use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::initializer::SessionInitializer;
use super::renewal::{HttpRenewer, RenewalCoordinator, TokenRenewer};
use super::state::{SessionState, SessionStateCell};
use super::store::{token_prefix, CredentialStore};
use super::types::{LoginResponse, Session, UserProfile};
use crate::config::Config;
use crate::error::{ApiError, LoginError};
use crate::http_client::{ApiRequest, ApiResponse, Dispatcher, Transport, LOGIN_PATH, LOGOUT_PATH, ME_PATH};
use crate::retry::{retry_rate_limited, RetryPolicy};

/// Session manager
///
/// Created once at process start. Owns the credential store, the renewal
/// coordinator, the dispatcher and the session state, and hands them out by
/// reference; nothing here is a global.
pub struct SessionManager {
    store: Arc<CredentialStore>,
    state: Arc<SessionStateCell>,
    coordinator: Arc<RenewalCoordinator>,
    dispatcher: Arc<Dispatcher>,
    retry_policy: RetryPolicy,
}

impl SessionManager {
    /// Create a session manager talking to the configured API
    pub fn new(config: &Config) -> Result<Self> {
        tracing::info!(api_url = %config.api_url, "Initializing session manager");

        let transport = Arc::new(Transport::new(
            &config.api_url,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?);
        let renewer = Arc::new(HttpRenewer::new(transport.clone()));

        Ok(Self::with_renewer(transport, renewer, config.retry_policy()))
    }

    /// Create a session manager with a custom renewal backend
    pub fn with_renewer(
        transport: Arc<Transport>,
        renewer: Arc<dyn TokenRenewer>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let store = Arc::new(CredentialStore::new());
        let state = Arc::new(SessionStateCell::new());
        let coordinator = Arc::new(RenewalCoordinator::new(renewer, store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            store.clone(),
            coordinator.clone(),
            state.clone(),
        ));

        Self {
            store,
            state,
            coordinator,
            dispatcher,
            retry_policy,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Watch session state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RenewalCoordinator> {
        &self.coordinator
    }

    /// Issue an API call through the dispatcher
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.dispatcher.issue(request).await
    }

    /// Build the startup restore task
    pub fn initializer(&self) -> SessionInitializer {
        SessionInitializer::new(
            self.coordinator.clone(),
            self.dispatcher.clone(),
            self.store.clone(),
            self.state.clone(),
            self.retry_policy.clone(),
        )
    }

    /// Sign in with email and password
    ///
    /// On any failure the session is fully reverted: store cleared, state
    /// `Unauthenticated`, and the error carries the message for the form.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, LoginError> {
        tracing::info!(email = %email, "Signing in");

        match self.try_login(email, password).await {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::warn!(email = %email, error = %e, "Login failed");
                self.store.clear();
                self.state.unauthenticate();
                Err(LoginError::from(e))
            }
        }
    }

    async fn try_login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let response: LoginResponse = self
            .dispatcher
            .post_json(LOGIN_PATH, json!({ "email": email, "password": password }))
            .await?;

        if response.access_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "login response does not contain access_token".to_string(),
            ));
        }
        if let Some(ref user) = response.user {
            tracing::debug!(user_id = %user.id, "Login response included a user summary");
        }

        tracing::debug!(token = %token_prefix(&response.access_token), "Login accepted");
        self.store.set(response.access_token);

        let session =
            fetch_profile(&self.dispatcher, &self.retry_policy, &CancellationToken::new()).await?;

        if !self.state.authenticate(&self.store, session.clone()) {
            return Err(ApiError::auth_expired());
        }
        Ok(session)
    }

    /// Sign out
    ///
    /// The backend call only invalidates the refresh cookie; whatever it
    /// returns, the local session ends. Safe to call repeatedly.
    pub async fn logout(&self) {
        tracing::info!(token = ?self.store.fingerprint(), "Signing out");

        let request = ApiRequest::post(LOGOUT_PATH).json(json!({}));
        if let Err(e) = self.dispatcher.issue(request).await {
            tracing::debug!(error = %e, "Logout request failed, clearing local session anyway");
        }

        self.store.clear();
        self.state.unauthenticate();
    }

    /// Reload the profile of the current session, e.g. after a password change
    pub async fn refresh_profile(&self) -> Result<Session, ApiError> {
        let session =
            fetch_profile(&self.dispatcher, &self.retry_policy, &CancellationToken::new()).await?;

        if !self.state.authenticate(&self.store, session.clone()) {
            return Err(ApiError::auth_expired());
        }
        Ok(session)
    }
}

/// `GET /auth/me`, retrying on 429
pub(crate) async fn fetch_profile(
    dispatcher: &Dispatcher,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Session, ApiError> {
    let profile = retry_rate_limited(policy, token, move |attempt| {
        tracing::debug!(attempt, "Fetching user profile");
        dispatcher.get_json::<UserProfile>(ME_PATH)
    })
    .await?;

    Ok(Session::from(profile))
}
