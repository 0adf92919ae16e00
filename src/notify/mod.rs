//! Inbound notification events and their deduplicated store.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::NotificationStore;

/// One notification received over the push channel.
///
/// The live set keeps at most one event per `sender_id`; a newer event from
/// the same sender replaces the old one (see [`NotificationStore::merge`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Server-side event id, when the server sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Sender's user id; dedup key for the store.
    pub sender_id: i64,
    /// Sender's display nickname.
    pub sender_nickname: String,
    /// When the server emitted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<DateTime<Utc>>,
    /// Human-readable notification text.
    #[serde(default)]
    pub message: String,
}
