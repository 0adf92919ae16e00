//! Session and realtime-notification client for a Warren community server.
//!
//! This crate is the connection-facing core of a Warren client: everything
//! between the UI and the server that has to be correct about credentials
//! and connection lifecycles lives here.
//!
//! # Architecture
//!
//! - [`session::SessionManager`] - the credential vault. Owns the in-memory
//!   session, encrypts identity fields at rest, and publishes token changes
//!   over a watch channel.
//! - [`api::ApiClient`] - the single outbound HTTP pipeline. Injects the
//!   bearer token, and on a first-time expired-token 401 refreshes the
//!   session and replays the failed request exactly once.
//! - [`stream::ChannelSupervisor`] - supervises the push-notification
//!   stream: one connection per session, periodic out-of-band health
//!   probes, reconnect on focus-while-closed, teardown on logout.
//! - [`notify::NotificationStore`] - deduplicated, persisted notification
//!   list fed by the supervisor.
//! - [`storage`] / [`crypto`] - the injected capabilities the above are
//!   built over: a blocking key-value store and an AES-256-GCM field
//!   cipher.
//!
//! # Wiring
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//!
//! use warren_client::api::ApiClient;
//! use warren_client::constants::HEALTH_PROBE_INTERVAL;
//! use warren_client::crypto::AesGcmCipher;
//! use warren_client::notify::NotificationStore;
//! use warren_client::session::SessionManager;
//! use warren_client::storage::{FileStore, KeyValueStore};
//! use warren_client::stream::{ChannelSupervisor, SseTransport};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open_default()?);
//! let cipher = Arc::new(AesGcmCipher::new([0u8; 32]));
//!
//! let session = Arc::new(SessionManager::new(Arc::clone(&store), cipher));
//! session.restore();
//!
//! let base_url = "https://warren.example.com".to_string();
//! let api = ApiClient::new(base_url.clone(), Arc::clone(&session))?;
//!
//! let notifications = Arc::new(Mutex::new(NotificationStore::new(store)));
//! let handle = ChannelSupervisor::spawn(
//!     Box::new(SseTransport::new(base_url)),
//!     api,
//!     notifications,
//!     HEALTH_PROBE_INTERVAL,
//! );
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod constants;
pub mod crypto;
pub mod notify;
pub mod session;
pub mod storage;
pub mod stream;

pub use api::{ApiClient, ApiError, ApiResponse, HealthStatus, PendingRequest};
pub use crypto::{AesGcmCipher, IdentityCipher};
pub use notify::{NotificationEvent, NotificationStore};
pub use session::{Session, SessionEvent, SessionManager, SessionScope};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use stream::{
    ChannelSupervisor, ConnectionState, EventStream, SseTransport, StreamError, StreamEvent,
    SupervisorHandle,
};
