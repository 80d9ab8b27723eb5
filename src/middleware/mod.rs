// Request middleware chain
//
// Layers run in order around the transport: credential attachment first,
// then renewal-and-replay on authorization rejection.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;

use crate::auth::{CredentialStore, RenewalCoordinator};
use crate::error::ApiError;
use crate::http_client::{ApiRequest, ApiResponse, Transport};

/// One step of the dispatch chain
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse, ApiError>;
}

/// The remainder of the chain, ending at the transport
///
/// `Next` is `Copy`, so a layer may run the rest of the chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    transport: &'a Transport,
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(transport: &'a Transport, chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { transport, chain }
    }

    pub async fn run(self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        match self.chain.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(
                        request,
                        Next {
                            transport: self.transport,
                            chain: rest,
                        },
                    )
                    .await
            }
            None => self.transport.send(&request).await,
        }
    }
}

/// Attaches `Authorization: Bearer <credential>` when a credential exists
///
/// Login and refresh requests are sent without one.
pub struct AttachCredentialLayer {
    store: Arc<CredentialStore>,
}

impl AttachCredentialLayer {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for AttachCredentialLayer {
    async fn handle(
        &self,
        mut request: ApiRequest,
        next: Next<'_>,
    ) -> Result<ApiResponse, ApiError> {
        request.bearer = if request.is_auth_endpoint() {
            None
        } else {
            self.store.get()
        };
        next.run(request).await
    }
}

/// Renews the credential on a 401 and replays the request exactly once
pub struct AuthRetryLayer {
    store: Arc<CredentialStore>,
    coordinator: Arc<RenewalCoordinator>,
}

impl AuthRetryLayer {
    pub fn new(store: Arc<CredentialStore>, coordinator: Arc<RenewalCoordinator>) -> Self {
        Self { store, coordinator }
    }
}

#[async_trait]
impl Middleware for AuthRetryLayer {
    async fn handle(&self, request: ApiRequest, next: Next<'_>) -> Result<ApiResponse, ApiError> {
        if request.is_auth_endpoint() {
            return next.run(request).await;
        }

        let response = next.run(request.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED || request.retried {
            return Ok(response);
        }

        let current = self.store.get();

        // Signed out, possibly after this request was sent: nothing to renew
        // unless a restore is already under way
        if current.is_none() && !self.coordinator.is_in_flight() {
            tracing::debug!(
                request_id = %request.request_id,
                "Received 401 while signed out, not renewing"
            );
            return Ok(response);
        }

        // Someone else already finished a renewal since this request was sent
        let credential = match current {
            Some(current) if request.bearer.as_deref() != Some(current.as_str()) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    "Credential changed while request was in flight, replaying"
                );
                current
            }
            _ => {
                tracing::info!(
                    request_id = %request.request_id,
                    path = %request.path,
                    "Received 401, renewing credential"
                );
                self.coordinator.renew().await?
            }
        };

        let mut replay = request;
        replay.bearer = Some(credential);
        replay.retried = true;
        next.run(replay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenRenewer;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct FixedRenewer(Result<String, ApiError>);

    #[async_trait]
    impl TokenRenewer for FixedRenewer {
        async fn renew(&self) -> Result<String, ApiError> {
            self.0.clone()
        }
    }

    /// Terminal layer standing in for the network: answers 401 unless the
    /// bearer matches `accept`, and records what it saw.
    struct Recorder {
        accept: Option<String>,
        seen: Mutex<Vec<(Option<String>, bool)>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(
            &self,
            request: ApiRequest,
            _next: Next<'_>,
        ) -> Result<ApiResponse, ApiError> {
            self.seen
                .lock()
                .push((request.bearer.clone(), request.retried));
            let status = if request.bearer.is_some() && request.bearer == self.accept {
                StatusCode::OK
            } else {
                StatusCode::UNAUTHORIZED
            };
            Ok(ApiResponse {
                status,
                body: Bytes::new(),
                credential: request.bearer.clone(),
            })
        }
    }

    fn setup(
        renewal: Result<String, ApiError>,
        accept: Option<&str>,
    ) -> (Arc<CredentialStore>, Vec<Arc<dyn Middleware>>, Arc<Recorder>, Transport) {
        let store = Arc::new(CredentialStore::new());
        let coordinator = Arc::new(RenewalCoordinator::new(
            Arc::new(FixedRenewer(renewal)),
            store.clone(),
        ));
        let recorder = Arc::new(Recorder {
            accept: accept.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        });
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(AttachCredentialLayer::new(store.clone())),
            Arc::new(AuthRetryLayer::new(store.clone(), coordinator)),
            recorder.clone(),
        ];
        let transport = Transport::new("http://127.0.0.1:9", 1, 1).unwrap();
        (store, chain, recorder, transport)
    }

    #[tokio::test]
    async fn test_attaches_current_credential() {
        let (store, chain, recorder, transport) = setup(Ok("unused".into()), Some("T1"));
        store.set("T1");

        let response = Next::new(&transport, &chain)
            .run(ApiRequest::get("/calls"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(*recorder.seen.lock(), vec![(Some("T1".to_string()), false)]);
    }

    #[tokio::test]
    async fn test_auth_endpoints_carry_no_bearer_and_are_not_retried() {
        let (store, chain, recorder, transport) = setup(Ok("T2".into()), Some("T2"));
        store.set("T1");

        let response = Next::new(&transport, &chain)
            .run(ApiRequest::post(crate::http_client::LOGIN_PATH))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(*recorder.seen.lock(), vec![(None, false)]);
        assert_eq!(store.get().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_renews_and_replays_once() {
        let (store, chain, recorder, transport) = setup(Ok("T2".into()), Some("T2"));
        store.set("T1");

        let response = Next::new(&transport, &chain)
            .run(ApiRequest::get("/calls"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                (Some("T1".to_string()), false),
                (Some("T2".to_string()), true)
            ]
        );
        assert_eq!(store.get().as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn test_replay_rejection_is_not_retried_again() {
        // Renewal succeeds but the server keeps rejecting
        let (store, chain, recorder, transport) = setup(Ok("T2".into()), None);
        store.set("T1");

        let response = Next::new(&transport, &chain)
            .run(ApiRequest::get("/calls"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_renewal_surfaces_auth_expired() {
        let (store, chain, recorder, transport) = setup(
            Err(ApiError::AuthForbidden {
                body: Default::default(),
            }),
            Some("T2"),
        );
        store.set("T1");

        let result = Next::new(&transport, &chain)
            .run(ApiRequest::get("/calls"))
            .await;

        assert!(matches!(result, Err(ApiError::AuthExpired { .. })));
        assert_eq!(recorder.seen.lock().len(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_signed_out_request_is_not_renewed() {
        // Renewal would succeed, so a 401 proves it was never called
        let (store, chain, recorder, transport) = setup(Ok("T2".into()), Some("T2"));

        let response = Next::new(&transport, &chain)
            .run(ApiRequest::get("/calls"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(*recorder.seen.lock(), vec![(None, false)]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_request_outliving_logout_is_not_renewed() {
        let (store, chain, recorder, transport) = setup(Ok("T2".into()), Some("T2"));

        // Sent with T1, answered after a logout emptied the store
        let mut request = ApiRequest::get("/calls");
        request.bearer = Some("T1".to_string());

        let response = Next::new(&transport, &chain[1..]).run(request).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(*recorder.seen.lock(), vec![(Some("T1".to_string()), false)]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_already_renewed_credential_skips_renewal() {
        // Renewal would fail, so success proves it was never called
        let (store, chain, _recorder, transport) =
            setup(Err(ApiError::auth_expired()), Some("T2"));
        store.set("T2");

        let mut request = ApiRequest::get("/calls");
        request.bearer = Some("T1".to_string());

        // Skip the attach layer to simulate a request sent before the renewal
        let response = Next::new(&transport, &chain[1..]).run(request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(store.get().as_deref(), Some("T2"));
    }
}
