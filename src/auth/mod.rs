// Authentication module
// Owns the in-memory credential, its renewal, and the session state machine

mod initializer;
mod manager;
mod renewal;
mod state;
mod store;
mod types;

pub use initializer::{InitOutcome, SessionInitializer};
pub use manager::SessionManager;
pub use renewal::{HttpRenewer, RenewalCoordinator, TokenRenewer};
pub use state::{SessionState, SessionStateCell};
pub use store::{token_prefix, CredentialStore};
pub use types::{LoginResponse, RefreshResponse, Session, UserProfile};
