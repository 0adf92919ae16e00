//! Application-wide constants for warren-client.
//!
//! This module centralizes magic numbers, storage keys, and endpoint paths
//! so they are discoverable in one place. Constants are grouped by domain
//! with documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for API calls.
///
/// Applies to individual HTTP requests to the server API. 10 seconds is
/// sufficient for normal API operations while preventing indefinite hangs
/// on network issues. The subscribe stream uses no timeout (long-lived).
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the push stream may stay silent before it is considered stale.
///
/// The server emits a heartbeat frame well inside this window, so expiry
/// means the connection is dead even if the socket has not errored yet.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

// ============================================================================
// Polling & reconnection
// ============================================================================

/// Interval between out-of-band health probes of the push channel.
///
/// The probe hits `GET /SSE/health-check` through the API client and is the
/// authoritative signal for forcing a reconnect; the stream's own errors
/// are advisory only.
pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Initial reconnection backoff for the SSE transport.
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum reconnection backoff for the SSE transport.
pub const MAX_BACKOFF_SECS: u64 = 30;

// ============================================================================
// Endpoint paths
// ============================================================================

/// Token refresh endpoint, relative to the server base URL.
pub const REFRESH_PATH: &str = "/USER/refresh";

/// Push-channel health-check endpoint.
pub const HEALTH_CHECK_PATH: &str = "/SSE/health-check";

/// Push-channel subscribe endpoint (server-sent events).
pub const SUBSCRIBE_PATH: &str = "/SSE/subscribe";

// ============================================================================
// Storage keys
// ============================================================================

/// Current session token, stored in the clear.
pub const KEY_TOKEN: &str = "token";

/// Elevated (administrative) session token, stored in the clear.
pub const KEY_ADMIN_TOKEN: &str = "admin_token";

/// Encrypted account email.
pub const KEY_EMAIL: &str = "email";

/// Encrypted account nickname.
pub const KEY_NICKNAME: &str = "nickname";

/// Encrypted profile image URL.
pub const KEY_PROFILE_IMAGE: &str = "profile_image";

/// Prefix for the per-token persisted notification mirror.
///
/// The full key is `notifications_{token}`; see [`notification_key`].
pub const NOTIFICATIONS_KEY_PREFIX: &str = "notifications_";

/// Build the persisted notification mirror key for a session token.
pub fn notification_key(token: &str) -> String {
    format!("{NOTIFICATIONS_KEY_PREFIX}{token}")
}

// ============================================================================
// Wire markers
// ============================================================================

/// Response-body marker for an expired bearer token.
pub const EXPIRED_TOKEN_MARKER: &str = "EXPIRED_TOKEN";

/// Response-body marker for "caller is not logged in" business errors.
pub const NO_LOGIN_MARKER: &str = "NO_LOGIN";

/// Health-check body meaning the server still holds a live subscription.
pub const HEALTH_CONNECTED: &str = "connected";

/// Health-check body meaning the server-side subscription is gone.
pub const HEALTH_DISCONNECTED: &str = "disconnected";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_key_includes_token() {
        assert_eq!(notification_key("abc123"), "notifications_abc123");
    }
}
