// Silent session restore at startup

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::fetch_profile;
use super::renewal::RenewalCoordinator;
use super::state::SessionStateCell;
use super::store::CredentialStore;
use super::types::Session;
use crate::error::ApiError;
use crate::http_client::Dispatcher;
use crate::retry::RetryPolicy;

/// How a restore attempt ended
#[derive(Debug, Clone)]
pub enum InitOutcome {
    /// The refresh cookie was valid and the profile loaded
    Restored(Session),
    /// No usable refresh cookie; the expected default for a fresh visitor
    NoSession,
    /// A transient failure; existing state was left untouched
    Deferred(ApiError),
    /// Torn down before settling; nothing was changed
    Cancelled,
}

/// Restores a session from the refresh cookie without user interaction
pub struct SessionInitializer {
    coordinator: Arc<RenewalCoordinator>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<CredentialStore>,
    state: Arc<SessionStateCell>,
    retry_policy: RetryPolicy,
}

impl SessionInitializer {
    pub(crate) fn new(
        coordinator: Arc<RenewalCoordinator>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<CredentialStore>,
        state: Arc<SessionStateCell>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            store,
            state,
            retry_policy,
        }
    }

    /// Run the restore until it settles or `token` is cancelled
    ///
    /// After cancellation no state is mutated; the outcome is `Cancelled`.
    pub async fn run(&self, token: CancellationToken) -> InitOutcome {
        if token.is_cancelled() {
            return InitOutcome::Cancelled;
        }

        tracing::debug!("Attempting silent session restore");

        let renewed = tokio::select! {
            biased;
            _ = token.cancelled() => return self.cancelled(),
            result = self.coordinator.renew() => result,
        };
        if token.is_cancelled() {
            return self.cancelled();
        }
        if let Err(e) = renewed {
            return self.settle_failure(e);
        }

        let profile = fetch_profile(&self.dispatcher, &self.retry_policy, &token).await;
        if token.is_cancelled() {
            return self.cancelled();
        }

        match profile {
            Ok(session) => {
                if self.state.authenticate(&self.store, session.clone()) {
                    InitOutcome::Restored(session)
                } else {
                    // Credential was cleared while the profile was loading
                    self.state.settle_initializing();
                    InitOutcome::NoSession
                }
            }
            Err(ApiError::Cancelled) => self.cancelled(),
            Err(e) => self.settle_failure(e),
        }
    }

    /// Run on a background task
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<InitOutcome> {
        tokio::spawn(async move { self.run(token).await })
    }

    fn settle_failure(&self, err: ApiError) -> InitOutcome {
        if err.is_definitive_auth_failure() {
            tracing::debug!("No session to restore");
            // The coordinator or dispatcher already cleared the credential,
            // unless a login landed in the meantime
            if self.store.is_empty() {
                self.state.unauthenticate();
            }
            return InitOutcome::NoSession;
        }

        tracing::warn!(error = %err, "Session restore deferred by a transient failure");
        self.state.settle_initializing();
        InitOutcome::Deferred(err)
    }

    fn cancelled(&self) -> InitOutcome {
        tracing::debug!("Session restore cancelled");
        InitOutcome::Cancelled
    }
}
