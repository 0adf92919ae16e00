//! API client for communicating with the Warren server.
//!
//! [`ApiClient`] is the single outbound pipeline: it injects the bearer
//! token (preferring an elevated administrative token), classifies failed
//! responses, and on a first-time expired-token 401 refreshes the session
//! token and replays the failed call exactly once. Refresh failure tears
//! down the affected credential scope via the vault.

use std::sync::Arc;

use anyhow::Result;
use reqwest::Client;

use super::{
    ApiError, ApiResponse, HealthStatus, PendingRequest, RefreshRequest, RefreshResponse,
};
use crate::constants::{
    EXPIRED_TOKEN_MARKER, HEALTH_CHECK_PATH, HEALTH_CONNECTED, HEALTH_DISCONNECTED,
    HTTP_REQUEST_TIMEOUT, NO_LOGIN_MARKER, REFRESH_PATH,
};
use crate::session::SessionManager;

/// HTTP pipeline for the Warren server.
///
/// Cheap to clone; all clones share the vault and the underlying
/// connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl ApiClient {
    /// Creates a new API client against the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: String, session: Arc<SessionManager>) -> Result<Self> {
        let http = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    /// Creates an API client with a pre-configured HTTP client.
    ///
    /// Useful for testing or when custom client configuration is needed.
    pub fn with_client(http: Client, base_url: String, session: Arc<SessionManager>) -> Self {
        Self {
            http,
            base_url,
            session,
        }
    }

    /// Returns the server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The session vault this client authenticates from.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Build an absolute URL from a server-relative path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request through the full pipeline.
    ///
    /// On a 401 carrying the expired-token marker (first occurrence for this
    /// request), the client refreshes the session token and replays the call
    /// once, returning the replay's outcome. All other failures pass through
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Network`] when no response was received.
    /// - [`ApiError::RefreshFailed`] when the refresh protocol failed; the
    ///   affected scope has already been cleared.
    /// - [`ApiError::Business`] for every other error status.
    pub async fn send(&self, request: PendingRequest) -> Result<ApiResponse, ApiError> {
        let response = self.execute(&request, None).await?;

        match Self::classify(&response, request.retried) {
            None => Ok(response),
            Some(ApiError::SessionExpired) => self.refresh_and_replay(request).await,
            Some(err) => Err(err),
        }
    }

    /// Classify a completed exchange. `None` means success.
    ///
    /// Order matters: the not-logged-in business marker is checked before
    /// the expired-token marker so that a "please log in" response is never
    /// mistaken for a refreshable auth failure.
    fn classify(response: &ApiResponse, retried: bool) -> Option<ApiError> {
        if (200..300).contains(&response.status) {
            return None;
        }

        if response.body.contains(NO_LOGIN_MARKER) {
            return Some(ApiError::Business {
                status: response.status,
                body: response.body.clone(),
            });
        }

        if response.status == 401 && response.body.contains(EXPIRED_TOKEN_MARKER) && !retried {
            return Some(ApiError::SessionExpired);
        }

        Some(ApiError::Business {
            status: response.status,
            body: response.body.clone(),
        })
    }

    /// Execute one HTTP exchange without any retry logic.
    ///
    /// `token_override` rewrites the Authorization header for replays; when
    /// absent the current vault bearer (admin preferred) is injected.
    async fn execute(
        &self,
        request: &PendingRequest,
        token_override: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let mut builder = self.http.request(request.method.clone(), &request.url);

        let bearer = token_override
            .map(str::to_string)
            .or_else(|| self.session.bearer_token());
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(ApiResponse { status, body })
    }

    /// Run the refresh protocol and replay the failed request once.
    ///
    /// The replay reuses the recorded method, URL, body, and non-auth
    /// headers verbatim; only the Authorization header is rewritten with the
    /// refreshed token, and only after that token has been persisted.
    async fn refresh_and_replay(
        &self,
        mut request: PendingRequest,
    ) -> Result<ApiResponse, ApiError> {
        log::info!("Token expired, refreshing before replaying {}", request.url);

        let email = match self.session.decrypt_email() {
            Ok(email) => email,
            Err(e) => {
                log::error!("Cannot refresh: persisted email unavailable: {e}");
                return Err(self.fail_session());
            }
        };

        let token = match self.refresh_token(&email).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Token refresh failed: {e}");
                return Err(self.fail_session());
            }
        };

        self.session.set_token(&token);
        request.retried = true;

        let response = self.execute(&request, Some(&token)).await?;
        match Self::classify(&response, request.retried) {
            None => {
                log::debug!("Replay of {} succeeded after refresh", request.url);
                Ok(response)
            }
            // retried=true, so a second expired-token 401 is passed through.
            Some(err) => Err(err),
        }
    }

    /// Tear down the credential scope an exhausted refresh belongs to.
    fn fail_session(&self) -> ApiError {
        let scope = self.session.active_scope();
        self.session.clear_scope(scope);
        ApiError::RefreshFailed { scope }
    }

    /// Call the refresh endpoint directly.
    ///
    /// Deliberately bypasses [`send`](Self::send): the refresh call must
    /// never trigger another refresh.
    pub async fn refresh_token(&self, email: &str) -> Result<String, ApiError> {
        let url = self.url(REFRESH_PATH);

        let response = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                email: email.to_string(),
            })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Business { status, body });
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Network(format!("Invalid refresh response: {e}")))?;

        Ok(parsed.result.token)
    }

    /// Probe the server-side state of the push channel.
    ///
    /// Goes through the full pipeline, so an expired token is refreshed
    /// before the probe result is read. Anything other than the literal
    /// `"connected"` body is reported as disconnected.
    pub async fn health_check(&self) -> Result<HealthStatus, ApiError> {
        let response = self
            .send(PendingRequest::get(self.url(HEALTH_CHECK_PATH)))
            .await?;

        let body = response.body.trim().trim_matches('"');
        match body {
            HEALTH_CONNECTED => Ok(HealthStatus::Connected),
            HEALTH_DISCONNECTED => Ok(HealthStatus::Disconnected),
            other => {
                log::warn!("Unexpected health-check body: {other:?}");
                Ok(HealthStatus::Disconnected)
            }
        }
    }
}
