// Session state machine

use tokio::sync::watch;

use super::store::CredentialStore;
use super::types::Session;

/// Session state exposed to the rest of the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Silent restore has not settled yet
    Initializing,
    Unauthenticated,
    Authenticated(Session),
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }
}

/// Reactive holder for [`SessionState`]
///
/// Observers call [`subscribe`](Self::subscribe) and are notified on every
/// transition. Repeated transitions into the same state are not re-published.
pub struct SessionStateCell {
    tx: watch::Sender<SessionState>,
}

impl SessionStateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Initializing);
        Self { tx }
    }

    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Publish an authenticated session
    ///
    /// Refused (returns false) when the store holds no credential, so a
    /// session never exists without one.
    pub fn authenticate(&self, store: &CredentialStore, session: Session) -> bool {
        if store.is_empty() {
            tracing::warn!("Refusing to publish a session without a credential");
            return false;
        }
        tracing::info!(user_id = %session.user_id, role = %session.role, "Session authenticated");
        self.tx.send_replace(SessionState::Authenticated(session));
        true
    }

    pub fn unauthenticate(&self) {
        self.tx.send_if_modified(|state| {
            if *state == SessionState::Unauthenticated {
                return false;
            }
            tracing::info!("Session ended");
            *state = SessionState::Unauthenticated;
            true
        });
    }

    /// Settle `Initializing` as `Unauthenticated`, leaving other states alone
    pub fn settle_initializing(&self) {
        self.tx.send_if_modified(|state| {
            if *state != SessionState::Initializing {
                return false;
            }
            *state = SessionState::Unauthenticated;
            true
        });
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}
