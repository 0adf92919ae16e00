//! Credential vault and session lifecycle.
//!
//! [`SessionManager`] is the single owner of the in-memory [`Session`].
//! Identity fields are encrypted before they touch the key-value store;
//! tokens are stored in the clear. Every other component treats the session
//! as read-only: `login`, `logout`, `set_token`, and `clear_scope` are the
//! only writers.
//!
//! Token changes are published over a `tokio::sync::watch` channel and
//! session-level failures (refresh exhausted) over a broadcast channel, so
//! nothing in this crate relies on ambient global events.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};

use crate::constants::{
    notification_key, KEY_ADMIN_TOKEN, KEY_EMAIL, KEY_NICKNAME, KEY_PROFILE_IMAGE, KEY_TOKEN,
};
use crate::crypto::IdentityCipher;
use crate::storage::KeyValueStore;

/// Which credential scope an operation applies to.
///
/// Administrative sessions carry an elevated token alongside (or instead of)
/// the normal one; expiry handling clears exactly one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    /// Regular member session.
    User,
    /// Elevated administrative session.
    Admin,
}

impl SessionScope {
    /// Entry point the UI should navigate to after this scope expires.
    pub fn redirect(self) -> &'static str {
        match self {
            Self::User => "/login",
            Self::Admin => "/admin/login",
        }
    }
}

/// Events published by the vault for the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session could not be refreshed and has been torn down.
    ///
    /// Carries the user-visible notice and the navigation target for the
    /// affected scope; the other scope's storage is untouched.
    Expired {
        /// Which scope was cleared.
        scope: SessionScope,
        /// Where the UI should send the user.
        redirect: &'static str,
    },
}

/// In-memory session identity.
///
/// Only [`SessionManager`] mutates this; everyone else reads clones.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Bearer token for the regular session, empty when logged out.
    pub token: String,
    /// Elevated administrative token, if an admin is signed in.
    pub admin_token: Option<String>,
    /// Account email (decrypted, in memory only).
    pub email: Option<String>,
    /// Display nickname.
    pub nickname: Option<String>,
    /// Profile image URL.
    pub profile_image: Option<String>,
    /// Whether a user session is active.
    pub logged_in: bool,
}

/// Owner of the session and its persisted, encrypted mirror.
pub struct SessionManager {
    session: RwLock<Session>,
    store: Arc<dyn KeyValueStore>,
    cipher: Arc<dyn IdentityCipher>,
    token_tx: watch::Sender<String>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("logged_in", &self.snapshot().logged_in)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a vault over the given storage and cipher capabilities.
    pub fn new(store: Arc<dyn KeyValueStore>, cipher: Arc<dyn IdentityCipher>) -> Self {
        let (token_tx, _) = watch::channel(String::new());
        let (event_tx, _) = broadcast::channel(8);

        Self {
            session: RwLock::new(Session::default()),
            store,
            cipher,
            token_tx,
            event_tx,
        }
    }

    /// Restore the session from persisted state at process start.
    ///
    /// Each identity field is decrypted independently; a decryption failure
    /// is logged and the field left unset. This never fails: worst case the
    /// user starts logged out.
    pub fn restore(&self) {
        let token = self.store.get(KEY_TOKEN).unwrap_or_default();
        let admin_token = self.store.get(KEY_ADMIN_TOKEN);

        let mut restored = Session {
            logged_in: !token.is_empty(),
            token,
            admin_token,
            ..Session::default()
        };

        for (key, field) in [
            (KEY_EMAIL, &mut restored.email),
            (KEY_NICKNAME, &mut restored.nickname),
            (KEY_PROFILE_IMAGE, &mut restored.profile_image),
        ] {
            if let Some(ciphertext) = self.store.get(key) {
                match self.cipher.decrypt(&ciphertext) {
                    Ok(plaintext) => *field = Some(plaintext),
                    Err(e) => log::warn!("Failed to decrypt persisted {key}: {e}"),
                }
            }
        }

        let token = restored.token.clone();
        *self.session.write().expect("session lock poisoned") = restored;
        let _ = self.token_tx.send(token);
        log::debug!("Session restored from storage");
    }

    /// Log in: encrypt and persist identity fields, store the token in the
    /// clear, then swap the in-memory session in one assignment so no reader
    /// observes a half-updated session.
    pub fn login(
        &self,
        token: &str,
        email: &str,
        nickname: &str,
        profile_image: &str,
    ) -> Result<()> {
        for (key, value) in [
            (KEY_EMAIL, email),
            (KEY_NICKNAME, nickname),
            (KEY_PROFILE_IMAGE, profile_image),
        ] {
            let ciphertext = self
                .cipher
                .encrypt(value)
                .with_context(|| format!("Failed to encrypt {key}"))?;
            self.store.set(key, &ciphertext);
        }
        self.store.set(KEY_TOKEN, token);

        let admin_token = self
            .session
            .read()
            .expect("session lock poisoned")
            .admin_token
            .clone();

        *self.session.write().expect("session lock poisoned") = Session {
            token: token.to_string(),
            admin_token,
            email: Some(email.to_string()),
            nickname: Some(nickname.to_string()),
            profile_image: Some(profile_image.to_string()),
            logged_in: true,
        };

        let _ = self.token_tx.send(token.to_string());
        log::info!("Logged in as {nickname}");
        Ok(())
    }

    /// Store an elevated administrative token alongside the session.
    pub fn admin_login(&self, token: &str) {
        self.store.set(KEY_ADMIN_TOKEN, token);
        self.session
            .write()
            .expect("session lock poisoned")
            .admin_token = Some(token.to_string());
        log::info!("Administrative session started");
    }

    /// Log out: remove every persisted key for this session and reset the
    /// in-memory session to empty.
    pub fn logout(&self) {
        let token = self.token();
        for key in [KEY_TOKEN, KEY_ADMIN_TOKEN, KEY_EMAIL, KEY_NICKNAME, KEY_PROFILE_IMAGE] {
            self.store.remove(key);
        }
        if !token.is_empty() {
            self.store.remove(&notification_key(&token));
        }

        *self.session.write().expect("session lock poisoned") = Session::default();
        let _ = self.token_tx.send(String::new());
        log::info!("Logged out");
    }

    /// Replace the session token after a successful refresh.
    ///
    /// Persists the new token before updating memory, then notifies watch
    /// subscribers. Identity fields are untouched. The notification mirror
    /// is keyed by token, so it moves to the new key; the old key is
    /// removed either way so rotations do not accumulate stale mirrors.
    pub fn set_token(&self, token: &str) {
        let old_token = self.token();
        self.store.set(KEY_TOKEN, token);

        if !old_token.is_empty() && old_token != token {
            let old_key = notification_key(&old_token);
            if !token.is_empty() {
                if let Some(mirror) = self.store.get(&old_key) {
                    self.store.set(&notification_key(token), &mirror);
                }
            }
            self.store.remove(&old_key);
        }

        {
            let mut session = self.session.write().expect("session lock poisoned");
            session.token = token.to_string();
            session.logged_in = !token.is_empty();
        }
        let _ = self.token_tx.send(token.to_string());
        log::debug!("Session token rotated");
    }

    /// Clear exactly one credential scope after an unrecoverable refresh
    /// failure, leaving the other scope's storage untouched.
    pub fn clear_scope(&self, scope: SessionScope) {
        match scope {
            SessionScope::Admin => {
                self.store.remove(KEY_ADMIN_TOKEN);
                self.session
                    .write()
                    .expect("session lock poisoned")
                    .admin_token = None;
                log::warn!("Administrative session expired");
            }
            SessionScope::User => {
                let token = self.token();
                for key in [KEY_TOKEN, KEY_EMAIL, KEY_NICKNAME, KEY_PROFILE_IMAGE] {
                    self.store.remove(key);
                }
                if !token.is_empty() {
                    self.store.remove(&notification_key(&token));
                }

                let mut session = self.session.write().expect("session lock poisoned");
                let admin_token = session.admin_token.clone();
                *session = Session {
                    admin_token,
                    ..Session::default()
                };
                drop(session);

                let _ = self.token_tx.send(String::new());
                log::warn!("Session expired");
            }
        }

        let _ = self.event_tx.send(SessionEvent::Expired {
            scope,
            redirect: scope.redirect(),
        });
    }

    /// Decrypt the persisted email for the refresh call.
    pub fn decrypt_email(&self) -> Result<String> {
        let ciphertext = self
            .store
            .get(KEY_EMAIL)
            .context("No persisted email to refresh with")?;
        self.cipher.decrypt(&ciphertext)
    }

    /// Snapshot of the current session.
    pub fn snapshot(&self) -> Session {
        self.session.read().expect("session lock poisoned").clone()
    }

    /// Current regular token (empty string when logged out).
    pub fn token(&self) -> String {
        self.session
            .read()
            .expect("session lock poisoned")
            .token
            .clone()
    }

    /// Token to present on outbound requests: the elevated token when one
    /// exists, the regular token otherwise. `None` when neither is set.
    pub fn bearer_token(&self) -> Option<String> {
        let session = self.session.read().expect("session lock poisoned");
        session
            .admin_token
            .clone()
            .or_else(|| (!session.token.is_empty()).then(|| session.token.clone()))
    }

    /// Whether an elevated token is currently held.
    pub fn has_admin_token(&self) -> bool {
        self.session
            .read()
            .expect("session lock poisoned")
            .admin_token
            .is_some()
    }

    /// Scope that would be affected by a refresh failure right now.
    pub fn active_scope(&self) -> SessionScope {
        if self.has_admin_token() {
            SessionScope::Admin
        } else {
            SessionScope::User
        }
    }

    /// Subscribe to token changes (login, refresh, logout).
    ///
    /// The receiver always holds the latest token; an empty string means
    /// logged out.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.token_tx.subscribe()
    }

    /// Subscribe to session-level events (expiry notices).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}
