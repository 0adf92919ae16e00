//! HTTP client core: request pipeline types and error taxonomy.
//!
//! The interesting part of talking to the Warren server is not the business
//! endpoints (plain JSON CRUD) but the failure handling around them: a 401
//! carrying the expired-token marker triggers a one-shot token refresh and
//! replay, transparently to the caller. [`client::ApiClient`] implements
//! that pipeline; this module holds the types it speaks.

pub mod client;

use serde::{Deserialize, Serialize};

use crate::session::SessionScope;

pub use client::ApiClient;

/// Transient descriptor of an outbound call, kept so a failed request can be
/// replayed after a token refresh.
///
/// `retried` flips from `false` to `true` at most once; a request that fails
/// again after its replay is never refreshed again.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// HTTP method.
    pub method: reqwest::Method,
    /// Absolute request URL.
    pub url: String,
    /// Extra headers, excluding `Authorization` (injected by the client).
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Whether this request has already been replayed once.
    pub retried: bool,
}

impl PendingRequest {
    /// Describe a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            retried: false,
        }
    }

    /// Describe a POST request with a JSON body.
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: reqwest::Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            retried: false,
        }
    }

    /// Attach an extra header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful response from the pipeline.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|e| ApiError::Business {
            status: self.status,
            body: format!("Invalid response body: {e}"),
        })
    }
}

/// Errors produced by the request pipeline.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// No response was received at all. Never retried.
    Network(String),
    /// A 401 with the expired-token marker, observed before any refresh
    /// attempt. Internal to the pipeline; callers normally see the replay
    /// outcome or [`ApiError::RefreshFailed`] instead.
    SessionExpired,
    /// The refresh call itself failed; the affected scope has been cleared
    /// and an expiry notice published.
    RefreshFailed {
        /// Scope that was torn down.
        scope: SessionScope,
    },
    /// Any other error status; passed through untouched for the calling
    /// feature to present.
    Business {
        /// HTTP status code.
        status: u16,
        /// Raw error body (`{ message?, msg? }` or a bare marker string).
        body: String,
    },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {msg}"),
            Self::SessionExpired => write!(f, "Session token expired"),
            Self::RefreshFailed { scope } => write!(f, "Token refresh failed ({scope:?} scope)"),
            Self::Business { status, body } => {
                let detail = serde_json::from_str::<ErrorBody>(body)
                    .ok()
                    .and_then(ErrorBody::into_message)
                    .unwrap_or_else(|| body.clone());
                write!(f, "Server error {status}: {detail}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Body of an error response, when the server sends structured JSON.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    /// Primary error message.
    pub message: Option<String>,
    /// Legacy error message field.
    pub msg: Option<String>,
}

impl ErrorBody {
    /// The user-facing message, preferring the primary field.
    pub fn into_message(self) -> Option<String> {
        self.message.or(self.msg)
    }
}

/// `POST /USER/refresh` request body.
#[derive(Debug, Serialize)]
pub struct RefreshRequest {
    /// Account email, decrypted from the vault for this call only.
    pub email: String,
}

/// `POST /USER/refresh` response.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    /// Result wrapper.
    pub result: RefreshResult,
}

/// Inner payload of the refresh response.
#[derive(Debug, Deserialize)]
pub struct RefreshResult {
    /// The replacement bearer token.
    pub token: String,
}

/// Server-side view of the push-channel connection, from the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The server still holds a live subscription for this session.
    Connected,
    /// The server-side subscription is gone; the client should reconnect.
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_request_builder() {
        let req = PendingRequest::post(
            "https://api.example.com/BOARD/write",
            serde_json::json!({ "title": "hi" }),
        )
        .header("X-Trace", "1");

        assert_eq!(req.method, reqwest::Method::POST);
        assert!(!req.retried);
        assert_eq!(req.headers, vec![("X-Trace".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_parses_refresh_response() {
        let json = r#"{ "result": { "token": "fresh-token" } }"#;
        let resp: RefreshResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.result.token, "fresh-token");
    }

    #[test]
    fn test_parses_error_body_variants() {
        let body: ErrorBody = serde_json::from_str(r#"{"message": "boom"}"#).unwrap();
        assert_eq!(body.message.as_deref(), Some("boom"));

        let body: ErrorBody = serde_json::from_str(r#"{"msg": "legacy"}"#).unwrap();
        assert_eq!(body.msg.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::Business {
            status: 404,
            body: "missing".to_string(),
        };
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("missing"));

        // A structured JSON body is unwrapped to its message.
        let err = ApiError::Business {
            status: 400,
            body: r#"{"message": "nickname taken"}"#.to_string(),
        };
        assert_eq!(err.to_string(), "Server error 400: nickname taken");

        let err = ApiError::RefreshFailed {
            scope: SessionScope::Admin,
        };
        assert!(err.to_string().contains("Admin"));
    }
}
