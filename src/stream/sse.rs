//! Server-sent-events transport for the push channel.
//!
//! Opens `GET {base}/SSE/subscribe` with a bearer token and incrementally
//! parses the event stream. The transport owns its own recovery: a dropped
//! or idle stream is reconnected with exponential backoff, and the idle
//! case is reported as [`StreamError::IdleTimeout`] so the supervisor knows
//! no action is needed. Only [`close`](SseTransport::close) ends the
//! transport for good.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot};

use super::{EventStream, ReadyState, StreamError, StreamEvent};
use crate::constants::{
    INITIAL_BACKOFF_SECS, MAX_BACKOFF_SECS, STREAM_IDLE_TIMEOUT, SUBSCRIBE_PATH,
};

/// Event feed buffer. Frames are small; the supervisor drains promptly.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const STATE_CLOSED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_OPEN: u8 = 2;

/// One parsed SSE frame: an event name and its (joined) data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field; `"message"` when the server omits it.
    pub event: String,
    /// The `data:` field(s), newline-joined.
    pub data: String,
}

/// Incremental SSE wire-format parser.
///
/// Feed it raw chunks as they arrive; it buffers partial lines across chunk
/// boundaries and emits a frame per blank-line separator. Comment lines
/// (leading `:`) and fields other than `event`/`data` are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every frame it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.flush() {
                    frames.push(frame);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn flush(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        if event.is_none() && data.is_empty() {
            return None;
        }

        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

/// Why a single stream read ended.
enum StreamEnd {
    /// `close()` was called; stop for good.
    Shutdown,
    /// No traffic inside the idle window; reconnect after reporting.
    Idle,
    /// The stream errored or ended; reconnect after reporting.
    Ended(String),
}

/// SSE transport over reqwest.
pub struct SseTransport {
    base_url: String,
    http: Client,
    state: Arc<AtomicU8>,
    events: Option<mpsc::Receiver<StreamEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("base_url", &self.base_url)
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    /// Create a transport against the given server base URL.
    ///
    /// Uses a dedicated HTTP client with no request timeout; the stream is
    /// long-lived by design and staleness is handled by the idle timer.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            events: None,
            shutdown_tx: None,
        }
    }

    /// Issue the subscribe request and check it was accepted.
    async fn connect(
        http: &Client,
        base_url: &str,
        token: &str,
    ) -> Result<reqwest::Response, StreamError> {
        let url = format!("{base_url}{SUBSCRIBE_PATH}");
        log::debug!("Opening subscribe stream: {url}");

        let response = http
            .get(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    /// Read one established stream until shutdown, idle expiry, or error.
    async fn consume_stream(
        response: reqwest::Response,
        event_tx: &mpsc::Sender<StreamEvent>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> StreamEnd {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        loop {
            let idle = tokio::time::sleep(STREAM_IDLE_TIMEOUT);
            tokio::pin!(idle);

            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.push(&String::from_utf8_lossy(&bytes)) {
                            if let Some(event) = Self::frame_to_event(frame) {
                                if event_tx.send(event).await.is_err() {
                                    // Receiver gone; the supervisor is done with us.
                                    return StreamEnd::Shutdown;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Ended(e.to_string()),
                    None => return StreamEnd::Ended("stream ended by server".to_string()),
                },

                _ = &mut idle => return StreamEnd::Idle,

                _ = &mut *shutdown_rx => return StreamEnd::Shutdown,
            }
        }
    }

    /// Map a wire frame onto a [`StreamEvent`]. Unknown names are dropped.
    fn frame_to_event(frame: SseFrame) -> Option<StreamEvent> {
        match frame.event.as_str() {
            "connect" => Some(StreamEvent::Connect),
            "heartbeat" => Some(StreamEvent::Heartbeat),
            "message" => match serde_json::from_str(&frame.data) {
                Ok(value) => Some(StreamEvent::Message(value)),
                Err(e) => {
                    log::warn!("Unparseable message frame dropped: {e}");
                    None
                }
            },
            other => {
                log::debug!("Ignoring unknown stream event {other:?}");
                None
            }
        }
    }

    /// Read loop with automatic reconnection.
    ///
    /// Runs until shutdown. Each reconnect cycle reports why the previous
    /// stream ended, then backs off exponentially with jitter before
    /// dialing again.
    async fn run_read_loop(
        http: Client,
        base_url: String,
        token: String,
        first_response: reqwest::Response,
        event_tx: mpsc::Sender<StreamEvent>,
        state: Arc<AtomicU8>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut response = Some(first_response);

        loop {
            if let Some(live) = response.take() {
                let end = Self::consume_stream(live, &event_tx, &mut shutdown_rx).await;
                state.store(STATE_CONNECTING, Ordering::SeqCst);

                match end {
                    StreamEnd::Shutdown => break,
                    StreamEnd::Idle => {
                        log::info!("Subscribe stream idle, reconnecting internally");
                        let _ = event_tx.send(StreamEvent::Error(StreamError::IdleTimeout)).await;
                    }
                    StreamEnd::Ended(reason) => {
                        log::warn!("Subscribe stream lost: {reason}");
                        let _ = event_tx
                            .send(StreamEvent::Error(StreamError::Connection(reason)))
                            .await;
                    }
                }
            }

            // Exponential backoff with jitter
            let jitter_ms = rand::random::<u64>() % 1000;
            let wait_ms = backoff_secs * 1000 + jitter_ms;
            log::debug!("Redialing subscribe stream in {:.1}s", wait_ms as f32 / 1000.0);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                _ = &mut shutdown_rx => break,
            }

            match Self::connect(&http, &base_url, &token).await {
                Ok(resp) => {
                    state.store(STATE_OPEN, Ordering::SeqCst);
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    response = Some(resp);
                }
                Err(e) => {
                    log::warn!("Subscribe redial failed: {e}");
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }

        state.store(STATE_CLOSED, Ordering::SeqCst);
        log::debug!("Subscribe stream closed");
    }
}

#[async_trait::async_trait]
impl EventStream for SseTransport {
    async fn open(&mut self, token: &str) -> Result<(), StreamError> {
        // At most one live stream per transport.
        self.close().await;

        self.state.store(STATE_CONNECTING, Ordering::SeqCst);
        let first_response = match Self::connect(&self.http, &self.base_url, token).await {
            Ok(resp) => resp,
            Err(e) => {
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.state.store(STATE_OPEN, Ordering::SeqCst);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.events = Some(event_rx);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(Self::run_read_loop(
            self.http.clone(),
            self.base_url.clone(),
            token.to_string(),
            first_response,
            event_tx,
            Arc::clone(&self.state),
            shutdown_rx,
        ));

        Ok(())
    }

    async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.events = None;
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ReadyState::Open,
            STATE_CONNECTING => ReadyState::Connecting,
            _ => ReadyState::Closed,
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events.take()
    }
}
