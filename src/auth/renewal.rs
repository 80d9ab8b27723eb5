// Credential renewal
//
// At most one renewal runs at a time. Callers arriving while one is in flight
// wait for its outcome instead of issuing their own.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::store::{token_prefix, CredentialStore};
use super::types::RefreshResponse;
use crate::error::ApiError;
use crate::http_client::{ApiRequest, Transport, REFRESH_PATH};

/// Exchanges the refresh cookie for a new access credential
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    async fn renew(&self) -> Result<String, ApiError>;
}

/// Renews against `POST /auth/refresh`
///
/// Goes straight to the transport so the renewal call itself is never
/// subject to renewal.
pub struct HttpRenewer {
    transport: Arc<Transport>,
}

impl HttpRenewer {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TokenRenewer for HttpRenewer {
    async fn renew(&self) -> Result<String, ApiError> {
        let request = ApiRequest::post(REFRESH_PATH).json(json!({}));
        let response = self.transport.send(&request).await?.error_for_status()?;
        let data: RefreshResponse = response.json()?;

        if data.access_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "refresh response does not contain access_token".to_string(),
            ));
        }

        Ok(data.access_token)
    }
}

type Waiter = oneshot::Sender<Result<String, ApiError>>;

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    waiters: Vec<Waiter>,
}

/// Serializes renewals and fans the single outcome out to every waiter
pub struct RenewalCoordinator {
    renewer: Arc<dyn TokenRenewer>,
    store: Arc<CredentialStore>,
    state: Mutex<RenewalState>,
    renewals: AtomicU64,
}

impl RenewalCoordinator {
    pub fn new(renewer: Arc<dyn TokenRenewer>, store: Arc<CredentialStore>) -> Self {
        Self {
            renewer,
            store,
            state: Mutex::new(RenewalState::default()),
            renewals: AtomicU64::new(0),
        }
    }

    /// Get a freshly renewed credential
    ///
    /// Joins the in-flight renewal if there is one. Fails with `AuthExpired`
    /// when the backend rejects the refresh cookie; transient failures are
    /// passed through unchanged and leave the store alone.
    pub async fn renew(&self) -> Result<String, ApiError> {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.in_flight {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    tracing::debug!(
                        waiters = state.waiters.len(),
                        "Renewal already in flight, waiting for its outcome"
                    );
                    Some(rx)
                } else {
                    state.in_flight = true;
                    None
                }
            };

            let Some(rx) = waiter else {
                return self.drive().await;
            };

            match rx.await {
                Ok(result) => return result,
                // The caller driving the renewal went away before it settled
                Err(_) => {
                    tracing::debug!("Renewal abandoned, retrying");
                    continue;
                }
            }
        }
    }

    /// Run the renewal call and settle every waiter with its outcome
    async fn drive(&self) -> Result<String, ApiError> {
        let mut guard = InFlight {
            coordinator: self,
            settled: false,
        };
        let epoch = self.store.epoch();
        self.renewals.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Renewing access credential");

        let result = match self.renewer.renew().await {
            Ok(token) => {
                if self.store.set_if_epoch(epoch, token.clone()) {
                    tracing::info!(token = %token_prefix(&token), "Access credential renewed");
                    Ok(token)
                } else {
                    // A login or logout landed first; its outcome wins
                    tracing::debug!("Credential changed during renewal, discarding result");
                    self.store.get().ok_or_else(ApiError::auth_expired)
                }
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Renewal failed with a transient error");
                Err(e)
            }
            Err(e) => {
                tracing::info!(error = %e, "Renewal rejected, clearing credential");
                if self.store.clear_if_epoch(epoch) {
                    Err(ApiError::auth_expired())
                } else {
                    self.store.get().ok_or_else(ApiError::auth_expired)
                }
            }
        };

        guard.settled = true;
        self.settle(&result);
        result
    }

    fn settle(&self, result: &Result<String, ApiError>) {
        // Take the list and go idle before notifying anyone
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        tracing::debug!(
            waiters = waiters.len(),
            success = result.is_ok(),
            "Renewal settled"
        );

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Number of renewal calls issued so far
    pub fn renewal_count(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }
}

/// Returns the coordinator to idle if the driving future is dropped early
///
/// Dropping the queued senders wakes every waiter, and the first one to
/// re-enter `renew` drives a new renewal.
struct InFlight<'a> {
    coordinator: &'a RenewalCoordinator,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let waiters = {
            let mut state = self.coordinator.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        tracing::debug!(waiters = waiters.len(), "Renewal cancelled before settling");
    }
}
