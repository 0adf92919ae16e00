//! Push-notification channel: transport capability and supervisor.
//!
//! The server pushes notifications over a long-lived subscribe stream. This
//! module splits that into two layers:
//!
//! - [`EventStream`] - the injected transport capability. [`sse::SseTransport`]
//!   is the real implementation (server-sent events over HTTP); tests inject
//!   fakes. A transport retries transient failures on its own and signals
//!   that with [`StreamError::IdleTimeout`].
//! - [`supervisor::ChannelSupervisor`] - owns exactly one connection per
//!   session, runs the periodic out-of-band health probe, and feeds parsed
//!   events into the notification store.

pub mod sse;
pub mod supervisor;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use sse::SseTransport;
pub use supervisor::{ChannelSupervisor, SupervisorHandle};

/// Connection state as tracked by the supervisor.
///
/// Owned exclusively by the supervisor; transitions are the only way the
/// state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none wanted (logged out or torn down).
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The stream is established.
    Open,
    /// The stream was lost or refused; a probe or focus event may revive it.
    Closed,
}

/// Transport-level readiness, reported by [`EventStream::ready_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    /// No stream.
    #[default]
    Closed,
    /// The transport is (re)connecting.
    Connecting,
    /// The stream is live.
    Open,
}

/// Events surfaced by a transport.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The server's named `connect` frame. Informational only.
    Connect,
    /// A named `message` frame with its JSON payload.
    Message(serde_json::Value),
    /// A named `heartbeat` frame. The transport has already reset its idle
    /// timer by the time this is observed.
    Heartbeat,
    /// A transport-level error. See [`StreamError`] for fatality.
    Error(StreamError),
}

/// Errors reported over the event feed.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The stream idled past the heartbeat window. The transport retries on
    /// its own; this is the explicit non-fatal signal, not an error-message
    /// substring to match on.
    IdleTimeout,
    /// Connection-level failure (handshake, mid-stream error, EOF).
    Connection(String),
    /// The subscribe endpoint refused the stream.
    Rejected {
        /// HTTP status of the refusal.
        status: u16,
    },
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "Stream idle timeout (transport retrying)"),
            Self::Connection(msg) => write!(f, "Stream connection error: {msg}"),
            Self::Rejected { status } => write!(f, "Subscribe rejected with status {status}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Injected push-stream transport.
///
/// One transport instance manages at most one live stream. `open` on an
/// already-open transport closes the old stream first.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Open an authenticated stream.
    ///
    /// Returns once the stream is established; subsequent transient failures
    /// are retried internally and reported over the event feed.
    async fn open(&mut self, token: &str) -> Result<(), StreamError>;

    /// Close the stream. Closing a closed transport is a no-op.
    async fn close(&mut self);

    /// Current transport readiness.
    fn ready_state(&self) -> ReadyState;

    /// Take the event feed for the stream opened by the last `open` call.
    ///
    /// Returns `None` before `open` or if already taken. The feed ends
    /// (receiver yields `None`) when the stream is closed for good.
    fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>>;
}

impl std::fmt::Debug for dyn EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventStream")
    }
}
