use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialStore, RenewalCoordinator, SessionStateCell};
use crate::error::{ApiError, ErrorBody};
use crate::middleware::{AttachCredentialLayer, AuthRetryLayer, Middleware, Next};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const ME_PATH: &str = "/auth/me";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// An outbound API call, before credentials are attached
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/auth/me`
    pub path: String,
    pub body: Option<Value>,
    /// Set by the credential layer; never set by callers for auth endpoints
    pub bearer: Option<String>,
    /// True once the request has been replayed after a renewal
    pub retried: bool,
    /// Short id used to correlate log lines
    pub request_id: String,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
            retried: false,
            request_id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Login and refresh never go through renewal, and never carry a bearer
    pub fn is_auth_endpoint(&self) -> bool {
        let path = self.path.split('?').next().unwrap_or_default();
        path == LOGIN_PATH || path == REFRESH_PATH
    }
}

/// A response that was received, whatever its status
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
    /// Credential the answered request carried
    pub credential: Option<String>,
}

impl ApiResponse {
    /// Decode a JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-success status into its categorized error
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(
                self.status,
                ErrorBody::parse(&self.body),
            ))
        }
    }
}

/// Raw HTTP transport against the dashboard API
///
/// The underlying client keeps a cookie jar, so the refresh cookie set by
/// `/auth/login` is replayed on `/auth/refresh` without this crate ever
/// reading it.
pub struct Transport {
    client: Client,
    base_url: String,
}

impl Transport {
    /// Create a new transport
    pub fn new(base_url: &str, connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(concat!("dashboard-session/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one request. Only a missing response is an error here.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);

        tracing::debug!(
            request_id = %request.request_id,
            method = %request.method,
            url = %url,
            authenticated = request.bearer.is_some(),
            retried = request.retried,
            "Sending HTTP request"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header("x-request-id", &request.request_id);

        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(
                request_id = %request.request_id,
                url = %url,
                error = %e,
                "HTTP request error"
            );
            ApiError::from(e)
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::from)?;

        tracing::debug!(
            request_id = %request.request_id,
            status = %status,
            "Received HTTP response"
        );

        Ok(ApiResponse {
            status,
            body,
            credential: request.bearer.clone(),
        })
    }
}

/// Request dispatcher
///
/// Every outbound call runs through an ordered middleware chain:
/// attach the credential, then renew and replay once on a 401.
pub struct Dispatcher {
    transport: Arc<Transport>,
    chain: Vec<Arc<dyn Middleware>>,
    store: Arc<CredentialStore>,
    state: Arc<SessionStateCell>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<CredentialStore>,
        coordinator: Arc<RenewalCoordinator>,
        state: Arc<SessionStateCell>,
    ) -> Self {
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(AttachCredentialLayer::new(store.clone())),
            Arc::new(AuthRetryLayer::new(store.clone(), coordinator)),
        ];

        Self {
            transport,
            chain,
            store,
            state,
        }
    }

    /// Issue a request through the middleware chain
    ///
    /// Non-success statuses are returned as categorized errors. A 401/403
    /// that survives the chain on a non-auth endpoint ends the session while
    /// the rejected credential is still the current one.
    pub async fn issue(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let is_auth_endpoint = request.is_auth_endpoint();
        let request_id = request.request_id.clone();
        let path = request.path.clone();

        let (result, answered) = match Next::new(&self.transport, &self.chain).run(request).await {
            Ok(response) => {
                let answered = response.credential.clone();
                (response.error_for_status(), answered)
            }
            // Failed renewals were already applied to the store by the coordinator
            Err(e) => (Err(e), None),
        };

        if let Err(ref e) = result {
            if !is_auth_endpoint && e.is_definitive_auth_failure() {
                self.end_session(&request_id, &path, e, answered.as_deref());
            } else {
                tracing::debug!(request_id = %request_id, path = %path, error = %e, "Request failed");
            }
        }

        result
    }

    /// End the session for a rejection, unless a newer login already replaced
    /// the credential that was rejected
    fn end_session(&self, request_id: &str, path: &str, err: &ApiError, answered: Option<&str>) {
        let current = match answered {
            Some(token) => self.store.clear_if_current(token),
            None => self.store.is_empty(),
        };

        if !current {
            tracing::debug!(
                request_id = %request_id,
                path = %path,
                error = %err,
                "Authorization failure for a replaced credential, keeping session"
            );
            return;
        }

        tracing::warn!(
            request_id = %request_id,
            path = %path,
            error = %err,
            "Definitive authorization failure, ending session"
        );
        self.state.unauthenticate();
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.issue(ApiRequest::get(path)).await?.json()
    }

    /// POST a JSON body to `path` and decode the JSON response
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, ApiError> {
        self.issue(ApiRequest::post(path).json(body)).await?.json()
    }
}
