//! Supervisor for the push-notification connection.
//!
//! Owns the lifecycle of exactly one stream per session: opens it on login,
//! closes it on logout or re-login, runs a periodic out-of-band health
//! probe through the API client, and reconnects with a strict one-close /
//! one-open discipline when the probe (or a focus event while closed) says
//! the stream is gone. Transport-level hiccups the transport retries on its
//! own are logged and otherwise ignored; the probe is authoritative.
//!
//! Parsed `message` frames carrying both sender fields are merged into the
//! shared [`NotificationStore`]; everything else on the stream is
//! informational.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ConnectionState, EventStream, StreamError, StreamEvent};
use crate::api::{ApiClient, HealthStatus};
use crate::notify::{NotificationEvent, NotificationStore};

/// Commands accepted by the supervisor task.
#[derive(Debug)]
enum Command {
    /// The window/tab regained focus.
    Focus,
    /// Force a reconnect cycle.
    Reconnect,
    /// Tear down and exit.
    Shutdown,
}

/// What woke the supervisor loop.
#[derive(Debug)]
enum Wake {
    Cmd(Option<Command>),
    TokenChanged(bool),
    Event(Option<StreamEvent>),
    Probe,
}

/// Handle to a running supervisor.
///
/// Dropping the handle does not stop the task; call
/// [`shutdown`](Self::shutdown) so teardown runs deterministically.
#[derive(Debug)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection-state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Report that the window/tab regained focus.
    ///
    /// Forces a reconnect only when the connection is currently closed.
    pub async fn notify_focus(&self) {
        let _ = self.cmd_tx.send(Command::Focus).await;
    }

    /// Force a close-then-open reconnect cycle.
    pub async fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect).await;
    }

    /// Stop the supervisor: cancel the probe timer, close the connection,
    /// and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

/// The supervisor task state. See the module docs for the state machine.
#[derive(Debug)]
pub struct ChannelSupervisor {
    transport: Box<dyn EventStream>,
    api: ApiClient,
    store: Arc<Mutex<NotificationStore>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ChannelSupervisor {
    /// Spawn the supervisor task.
    ///
    /// The supervisor follows the session vault reachable through `api`:
    /// it opens a stream when a token appears, swaps streams when the token
    /// changes, and closes on logout. `probe_interval` is how often the
    /// health endpoint is polled while logged in
    /// (normally [`crate::constants::HEALTH_PROBE_INTERVAL`]).
    pub fn spawn(
        transport: Box<dyn EventStream>,
        api: ApiClient,
        store: Arc<Mutex<NotificationStore>>,
        probe_interval: Duration,
    ) -> SupervisorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let token_rx = api.session().subscribe();

        let supervisor = Self {
            transport,
            api,
            store,
            state_tx,
        };
        let task = tokio::spawn(supervisor.run(cmd_rx, token_rx, probe_interval));

        SupervisorHandle {
            cmd_tx,
            state_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut token_rx: watch::Receiver<String>,
        probe_interval: Duration,
    ) {
        let mut probe = tokio::time::interval(probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; a probe right
        // after connecting would be noise.
        probe.tick().await;

        let mut token = token_rx.borrow_and_update().clone();
        let mut events: Option<mpsc::Receiver<StreamEvent>> = None;

        if !token.is_empty() {
            self.bind_store(&token);
            events = self.open(&token).await;
        }

        loop {
            let wake = tokio::select! {
                cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                res = token_rx.changed() => Wake::TokenChanged(res.is_ok()),
                event = next_event(&mut events) => Wake::Event(event),
                _ = probe.tick() => Wake::Probe,
            };

            match wake {
                Wake::Cmd(None | Some(Command::Shutdown)) => break,

                Wake::Cmd(Some(Command::Focus)) => {
                    if self.state() == ConnectionState::Closed && !token.is_empty() {
                        log::info!("Focus regained while closed, reconnecting");
                        events = self.reconnect(&token).await;
                    }
                }

                Wake::Cmd(Some(Command::Reconnect)) => {
                    if !token.is_empty() {
                        events = self.reconnect(&token).await;
                    }
                }

                // The vault is gone; nothing left to supervise.
                Wake::TokenChanged(false) => break,

                Wake::TokenChanged(true) => {
                    let new_token = token_rx.borrow_and_update().clone();
                    if new_token == token {
                        continue;
                    }

                    // At most one live connection: the old stream goes away
                    // before any new one is dialed.
                    if events.is_some() {
                        self.close().await;
                        events = None;
                    }

                    token = new_token;
                    self.bind_store(&token);

                    if token.is_empty() {
                        self.set_state(ConnectionState::Disconnected);
                        log::debug!("Logged out, push channel released");
                    } else {
                        events = self.open(&token).await;
                    }
                }

                Wake::Event(None) => {
                    // The transport's feed ended without us closing it.
                    events = None;
                    self.set_state(ConnectionState::Closed);
                    log::warn!("Push stream feed ended, awaiting probe recovery");
                }

                Wake::Event(Some(event)) => self.handle_stream_event(event),

                Wake::Probe => {
                    if token.is_empty() {
                        continue;
                    }

                    let healthy = self.probe_healthy().await;

                    // A command may have arrived while the probe was in
                    // flight; a shutdown wins and the probe result is
                    // discarded rather than applied.
                    let mut force = false;
                    match cmd_rx.try_recv() {
                        Ok(Command::Shutdown) => break,
                        Ok(Command::Reconnect) => force = true,
                        Ok(Command::Focus) => {
                            force = self.state() == ConnectionState::Closed;
                        }
                        Err(_) => {}
                    }

                    if !healthy || force {
                        events = self.reconnect(&token).await;
                    }
                }
            }
        }

        // Teardown runs on every exit path: timer and focus commands die
        // with this task, the connection is closed here.
        self.close().await;
        drop(events);
        self.set_state(ConnectionState::Disconnected);
        log::debug!("Notification channel supervisor stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Point the shared store at this token's persisted mirror.
    fn bind_store(&self, token: &str) {
        self.store
            .lock()
            .expect("notification store lock poisoned")
            .restore(token);
    }

    /// Open an authenticated stream and hand back its event feed.
    async fn open(&mut self, token: &str) -> Option<mpsc::Receiver<StreamEvent>> {
        self.set_state(ConnectionState::Connecting);

        match self.transport.open(token).await {
            Ok(()) => {
                self.set_state(ConnectionState::Open);
                log::info!("Push channel connected");
                self.transport.take_events()
            }
            Err(e) => {
                log::warn!("Push channel connect failed: {e}");
                self.set_state(ConnectionState::Closed);
                None
            }
        }
    }

    async fn close(&mut self) {
        self.transport.close().await;
        self.set_state(ConnectionState::Closed);
    }

    /// Hard reconnect: exactly one close and exactly one open.
    async fn reconnect(&mut self, token: &str) -> Option<mpsc::Receiver<StreamEvent>> {
        self.close().await;
        self.open(token).await
    }

    fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Connect => {
                log::debug!("Push channel acknowledged subscription");
            }
            StreamEvent::Heartbeat => {
                log::trace!("Push channel heartbeat");
            }
            StreamEvent::Message(payload) => {
                // Frames must carry both sender fields to become an event;
                // anything else is dropped without touching the store.
                match serde_json::from_value::<NotificationEvent>(payload) {
                    Ok(event) => {
                        log::debug!(
                            "Notification from {} (sender {})",
                            event.sender_nickname,
                            event.sender_id
                        );
                        self.store
                            .lock()
                            .expect("notification store lock poisoned")
                            .merge(event);
                    }
                    Err(e) => log::debug!("Ignoring message frame without sender fields: {e}"),
                }
            }
            StreamEvent::Error(StreamError::IdleTimeout) => {
                // The transport reconnects on its own for this class.
                log::info!("Push stream idle timeout, transport retry in progress");
            }
            StreamEvent::Error(e) => {
                // Genuine failure. Recovery belongs to the health probe.
                log::error!("Push stream error: {e}");
            }
        }
    }

    async fn probe_healthy(&self) -> bool {
        match self.api.health_check().await {
            Ok(HealthStatus::Connected) => true,
            Ok(HealthStatus::Disconnected) => {
                log::warn!("Health probe: server lost our subscription");
                false
            }
            Err(e) => {
                // Treat a failed probe as disconnected.
                log::warn!("Health probe failed ({e}), reconnecting defensively");
                false
            }
        }
    }
}

/// Wait for the next stream event, or forever when no stream is open.
async fn next_event(events: &mut Option<mpsc::Receiver<StreamEvent>>) -> Option<StreamEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::crypto::AesGcmCipher;
    use crate::session::SessionManager;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::stream::ReadyState;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct MockShared {
        opens: usize,
        closes: usize,
        fail_next_open: bool,
        last_token: Option<String>,
        event_tx: Option<mpsc::Sender<StreamEvent>>,
    }

    struct MockTransport {
        shared: Arc<Mutex<MockShared>>,
        pending_rx: Option<mpsc::Receiver<StreamEvent>>,
    }

    impl MockTransport {
        fn new() -> (Self, Arc<Mutex<MockShared>>) {
            let shared = Arc::new(Mutex::new(MockShared::default()));
            (
                Self {
                    shared: Arc::clone(&shared),
                    pending_rx: None,
                },
                shared,
            )
        }
    }

    #[async_trait]
    impl EventStream for MockTransport {
        async fn open(&mut self, token: &str) -> Result<(), StreamError> {
            let mut shared = self.shared.lock().unwrap();
            shared.opens += 1;
            shared.last_token = Some(token.to_string());

            if shared.fail_next_open {
                shared.fail_next_open = false;
                return Err(StreamError::Connection("refused".to_string()));
            }

            let (tx, rx) = mpsc::channel(16);
            shared.event_tx = Some(tx);
            self.pending_rx = Some(rx);
            Ok(())
        }

        async fn close(&mut self) {
            let mut shared = self.shared.lock().unwrap();
            if shared.event_tx.take().is_some() {
                shared.closes += 1;
            }
            self.pending_rx = None;
        }

        fn ready_state(&self) -> ReadyState {
            if self.shared.lock().unwrap().event_tx.is_some() {
                ReadyState::Open
            } else {
                ReadyState::Closed
            }
        }

        fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
            self.pending_rx.take()
        }
    }

    struct Fixture {
        session: Arc<SessionManager>,
        store: Arc<Mutex<NotificationStore>>,
        backing: Arc<MemoryStore>,
        shared: Arc<Mutex<MockShared>>,
        handle: SupervisorHandle,
        _server: MockServer,
    }

    async fn fixture(probe_interval: Duration, health_responses: &[(u16, &str)]) -> Fixture {
        let server = MockServer::start().await;

        // Each response is served once, in order; the last repeats forever.
        if let Some(((last_status, last_body), limited)) = health_responses.split_last() {
            for (status, body) in limited {
                Mock::given(method("GET"))
                    .and(path("/SSE/health-check"))
                    .respond_with(ResponseTemplate::new(*status).set_body_string(*body))
                    .up_to_n_times(1)
                    .mount(&server)
                    .await;
            }
            Mock::given(method("GET"))
                .and(path("/SSE/health-check"))
                .respond_with(ResponseTemplate::new(*last_status).set_body_string(*last_body))
                .mount(&server)
                .await;
        }

        let backing = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionManager::new(
            Arc::clone(&backing) as Arc<dyn KeyValueStore>,
            Arc::new(AesGcmCipher::new([8u8; 32])),
        ));
        let api = ApiClient::new(server.uri(), Arc::clone(&session)).unwrap();
        let store = Arc::new(Mutex::new(NotificationStore::new(
            Arc::clone(&backing) as Arc<dyn KeyValueStore>,
        )));

        let (transport, shared) = MockTransport::new();
        let handle = ChannelSupervisor::spawn(
            Box::new(transport),
            api,
            Arc::clone(&store),
            probe_interval,
        );

        Fixture {
            session,
            store,
            backing,
            shared,
            handle,
            _server: server,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn push_message(shared: &Arc<Mutex<MockShared>>, payload: serde_json::Value) {
        let tx = shared.lock().unwrap().event_tx.clone().unwrap();
        tx.send(StreamEvent::Message(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn test_login_opens_stream_and_merges_messages() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        fx.session.login("tok-a", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().event_tx.is_some()).await;

        assert_eq!(fx.shared.lock().unwrap().last_token.as_deref(), Some("tok-a"));
        assert_eq!(fx.handle.state(), ConnectionState::Open);

        push_message(
            &fx.shared,
            serde_json::json!({ "senderId": 42, "senderNickname": "mittens", "message": "first" }),
        )
        .await;
        push_message(
            &fx.shared,
            serde_json::json!({ "senderId": 42, "senderNickname": "mittens", "message": "second" }),
        )
        .await;
        // Missing senderId: ignored, no store mutation.
        push_message(&fx.shared, serde_json::json!({ "senderNickname": "ghost" })).await;

        let store = Arc::clone(&fx.store);
        wait_until(move || {
            let store = store.lock().unwrap();
            store.len() == 1 && store.events()[0].message == "second"
        })
        .await;

        fx.handle.shutdown().await;
        let shared = fx.shared.lock().unwrap();
        assert_eq!(shared.closes, 1);
        assert!(shared.event_tx.is_none(), "no connection handle after teardown");
    }

    #[tokio::test]
    async fn test_unhealthy_probe_forces_exactly_one_reconnect() {
        let fx = fixture(Duration::from_millis(50), &[(200, "disconnected"), (200, "connected")]).await;

        fx.session.login("tok-b", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 1).await;

        // The first probe sees "disconnected" and forces one close + open.
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 2).await;
        assert_eq!(fx.shared.lock().unwrap().closes, 1);

        // Later probes see "connected" and leave the stream alone.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let shared = fx.shared.lock().unwrap();
        assert_eq!(shared.opens, 2);
        assert_eq!(shared.closes, 1);
        drop(shared);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_errors_never_trigger_supervisor_reconnect() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        fx.session.login("tok-h", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().event_tx.is_some()).await;

        // An idle timeout means the transport is already redialing on its
        // own; a connection error waits for the probe. Neither may cause a
        // close or open here.
        let tx = fx.shared.lock().unwrap().event_tx.clone().unwrap();
        tx.send(StreamEvent::Error(StreamError::IdleTimeout))
            .await
            .unwrap();
        tx.send(StreamEvent::Error(StreamError::Connection(
            "reset by peer".to_string(),
        )))
        .await
        .unwrap();

        // A trailing message doubles as a barrier: once it is merged, the
        // errors before it have been handled.
        push_message(
            &fx.shared,
            serde_json::json!({ "senderId": 9, "senderNickname": "s", "message": "after" }),
        )
        .await;
        let store = Arc::clone(&fx.store);
        wait_until(move || store.lock().unwrap().len() == 1).await;

        let shared = fx.shared.lock().unwrap();
        assert_eq!(shared.opens, 1);
        assert_eq!(shared.closes, 0);
        drop(shared);
        assert_eq!(fx.handle.state(), ConnectionState::Open);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_probe_reconnects_like_disconnected() {
        // The probe endpoint errors once, then reports healthy.
        let fx = fixture(Duration::from_millis(50), &[(500, "boom"), (200, "connected")]).await;

        fx.session.login("tok-i", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 1).await;

        // The failing probe forces exactly one close + open.
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 2).await;
        assert_eq!(fx.shared.lock().unwrap().closes, 1);

        // Healthy probes afterwards leave the stream alone.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let shared = fx.shared.lock().unwrap();
        assert_eq!(shared.opens, 2);
        assert_eq!(shared.closes, 1);
        drop(shared);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_focus_reconnects_only_while_closed() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;
        fx.shared.lock().unwrap().fail_next_open = true;

        fx.session.login("tok-c", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 1).await;

        let handle_state = fx.handle.state_changes();
        wait_until(move || *handle_state.borrow() == ConnectionState::Closed).await;

        // Focus while closed: reconnect.
        fx.handle.notify_focus().await;
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 2).await;
        let state_rx = fx.handle.state_changes();
        wait_until(move || *state_rx.borrow() == ConnectionState::Open).await;

        // Focus while open: no action.
        fx.handle.notify_focus().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.shared.lock().unwrap().opens, 2);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_relogin_swaps_streams_close_before_open() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        fx.session.login("tok-old", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 1).await;

        fx.session.login("tok-new", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().opens == 2).await;

        let shared = fx.shared.lock().unwrap();
        assert_eq!(shared.closes, 1);
        assert_eq!(shared.last_token.as_deref(), Some("tok-new"));
        drop(shared);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_closes_stream_and_releases_handle() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        fx.session.login("tok-d", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().event_tx.is_some()).await;

        fx.session.logout();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().event_tx.is_none()).await;

        let state_rx = fx.handle.state_changes();
        wait_until(move || *state_rx.borrow() == ConnectionState::Disconnected).await;
        assert_eq!(fx.shared.lock().unwrap().closes, 1);

        fx.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_then_immediate_logout_leaks_no_connection() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        // Logout lands before the supervisor necessarily observed the login;
        // whichever interleaving happens, no handle may survive.
        fx.session.login("tok-f", "a@b.com", "nick", "img").unwrap();
        fx.session.logout();

        let state_rx = fx.handle.state_changes();
        wait_until(move || *state_rx.borrow() == ConnectionState::Disconnected).await;
        assert!(fx.shared.lock().unwrap().event_tx.is_none());

        fx.handle.shutdown().await;
        assert!(fx.shared.lock().unwrap().event_tx.is_none());
    }

    #[tokio::test]
    async fn test_merged_events_are_mirrored_under_session_token() {
        let fx = fixture(Duration::from_secs(3600), &[(200, "connected")]).await;

        fx.session.login("tok-e", "a@b.com", "nick", "img").unwrap();
        let shared = Arc::clone(&fx.shared);
        wait_until(move || shared.lock().unwrap().event_tx.is_some()).await;

        push_message(
            &fx.shared,
            serde_json::json!({ "senderId": 7, "senderNickname": "s", "message": "hi" }),
        )
        .await;

        let backing = Arc::clone(&fx.backing);
        wait_until(move || backing.get("notifications_tok-e").is_some()).await;

        fx.handle.shutdown().await;
    }
}
