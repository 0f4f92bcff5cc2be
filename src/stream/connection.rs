//! Reconnecting stream connection.
//!
//! One `StreamConnection` owns one logical streaming session: it acquires an
//! authenticated byte stream, decodes it incrementally into event records,
//! hands each record to the dispatcher in decode order, and reconnects with
//! exponential backoff when the stream ends or fails. `disconnect()` is the
//! sole cancellation primitive; it suppresses reconnects, stops in-flight
//! reads at their next suspension point, and drops buffered events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{interval, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthenticatedInvoker, InvokeError, SessionStore};
use crate::backoff::ReconnectPolicy;
use crate::dispatch::EventDispatcher;
use crate::event::EventRecord;
use crate::stream::decode::{Frame, FrameDecoder};

/// Errors produced by the stream transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote rejected the credential (HTTP 401 or equivalent).
    #[error("authorization rejected")]
    Unauthorized,

    /// Non-success HTTP status other than an authorization rejection.
    #[error("http status {status}")]
    Http { status: u16 },

    /// Network-level failure while connecting or reading.
    #[error("connection failure: {0}")]
    Connection(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Unbounded byte stream carrying the event-stream framing.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Collaborator that opens an authenticated byte stream.
#[async_trait]
pub trait StreamAcquirer: Send + Sync {
    async fn acquire(&self, credential: SecretString) -> Result<ByteStream, TransportError>;
}

/// Lifecycle of the logical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Tuning for reconnect, buffering, and staleness monitoring.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
    /// Maximum records held while no subscriber is registered.
    pub buffer_capacity: usize,
    /// Idle duration after which the connection is reported stale.
    ///
    /// Advisory only: exceeding it logs a warning and never forces a
    /// reconnect.
    pub stale_after: Duration,
    /// How often the staleness check runs while open.
    pub health_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            buffer_capacity: 256,
            stale_after: Duration::from_secs(60),
            health_interval: Duration::from_secs(15),
        }
    }
}

/// Synchronous diagnostics snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub is_connected: bool,
    pub connection_duration_ms: Option<u64>,
    pub event_count: u64,
    pub reconnect_attempts: usize,
    pub last_event_time_ms: Option<u64>,
    pub buffered_events: usize,
    /// True once the reconnect ceiling was exhausted; cleared by `connect()`.
    pub gave_up: bool,
}

struct ConnState {
    phase: ConnectionState,
    manual_disconnect: bool,
    gave_up: bool,
    reconnect_attempts: usize,
    connected_at: Option<Instant>,
    buffer: VecDeque<EventRecord>,
    cancel: CancellationToken,
}

struct Inner {
    invoker: AuthenticatedInvoker,
    acquirer: Arc<dyn StreamAcquirer>,
    dispatcher: Arc<EventDispatcher>,
    options: StreamOptions,
    state: Mutex<ConnState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the single logical streaming session.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl StreamConnection {
    /// Creates a closed connection; call `connect()` to start it.
    pub fn new(
        session: Arc<SessionStore>,
        acquirer: Arc<dyn StreamAcquirer>,
        dispatcher: Arc<EventDispatcher>,
        options: StreamOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                invoker: AuthenticatedInvoker::new(session),
                acquirer,
                dispatcher,
                options,
                state: Mutex::new(ConnState {
                    phase: ConnectionState::Closed,
                    manual_disconnect: false,
                    gave_up: false,
                    reconnect_attempts: 0,
                    connected_at: None,
                    buffer: VecDeque::new(),
                    cancel: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Starts the connection worker.
    ///
    /// No-op while already connecting or open, and when the session holds no
    /// credential. Clears the manual-disconnect and gave-up flags.
    pub fn connect(&self) {
        if !self.inner.invoker.session().is_authenticated() {
            debug!(event = "connect_skipped", reason = "unauthenticated");
            return;
        }

        let cancel = {
            let mut state = self.inner.state();
            if state.phase != ConnectionState::Closed {
                debug!(event = "connect_skipped", reason = "already active");
                return;
            }
            state.phase = ConnectionState::Connecting;
            state.manual_disconnect = false;
            state.gave_up = false;
            state.reconnect_attempts = 0;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_worker(inner, cancel).await;
        });
    }

    /// Stops the connection and suppresses automatic reconnects.
    ///
    /// Cancels the worker token (no reconnect timer survives), transitions to
    /// closed, and discards buffered undelivered events.
    pub fn disconnect(&self) {
        let mut state = self.inner.state();
        state.manual_disconnect = true;
        state.cancel.cancel();
        state.phase = ConnectionState::Closed;
        state.connected_at = None;
        state.buffer.clear();
        debug!(event = "stream_disconnected", reason = "manual");
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        self.inner.state().phase
    }

    /// The dispatcher this connection feeds.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    /// Synchronous diagnostics snapshot.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let state = self.inner.state();
        DiagnosticsSnapshot {
            is_connected: state.phase == ConnectionState::Open,
            connection_duration_ms: state
                .connected_at
                .map(|opened| opened.elapsed().as_millis() as u64),
            event_count: self.inner.dispatcher.event_count(),
            reconnect_attempts: state.reconnect_attempts,
            last_event_time_ms: self.inner.dispatcher.last_event_time_ms(),
            buffered_events: state.buffer.len(),
            gave_up: state.gave_up,
        }
    }
}

enum ReadOutcome {
    Cancelled,
    EndOfStream,
    TransportFailed,
}

async fn run_worker(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        {
            let mut state = inner.state();
            if state.manual_disconnect {
                return;
            }
            state.phase = ConnectionState::Connecting;
        }

        let acquirer = Arc::clone(&inner.acquirer);
        let acquired = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.invoker.invoke(
                move |credential| {
                    let acquirer = Arc::clone(&acquirer);
                    async move { acquirer.acquire(credential).await }
                },
                TransportError::is_unauthorized,
            ) => result,
        };

        match acquired {
            Ok(stream) => {
                if !mark_open(&inner, &cancel) {
                    return;
                }
                info!(event = "stream_open");
                deliver(&inner, &cancel, EventRecord::connection_established());

                let outcome = read_stream(&inner, stream, &cancel).await;
                mark_closed(&inner, &cancel);
                match outcome {
                    ReadOutcome::Cancelled => return,
                    ReadOutcome::EndOfStream => debug!(event = "stream_ended"),
                    ReadOutcome::TransportFailed => warn!(event = "stream_failed"),
                }
            }
            Err(InvokeError::Unauthenticated) | Err(InvokeError::AuthenticationRequired) => {
                // Re-login is required out-of-band; reconnecting cannot help.
                mark_closed(&inner, &cancel);
                warn!(event = "stream_auth_failed");
                return;
            }
            Err(InvokeError::Op(err)) => {
                mark_closed(&inner, &cancel);
                warn!(event = "stream_open_failed", error = %err);
            }
        }

        let delay = {
            let mut state = inner.state();
            if state.manual_disconnect || cancel.is_cancelled() {
                return;
            }
            state.reconnect_attempts += 1;
            let attempt = state.reconnect_attempts;
            if !inner.options.reconnect.allows_attempt(attempt) {
                state.gave_up = true;
                warn!(event = "reconnect_gave_up", attempts = attempt - 1);
                return;
            }
            inner.options.reconnect.delay_for_attempt(attempt)
        };

        debug!(event = "reconnect_scheduled", delay_ms = delay.as_millis() as u64);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn read_stream(
    inner: &Inner,
    mut stream: ByteStream,
    cancel: &CancellationToken,
) -> ReadOutcome {
    let mut decoder = FrameDecoder::new();
    let mut last_event = Instant::now();
    let mut health = interval(inner.options.health_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            _ = health.tick() => {
                let idle = last_event.elapsed();
                if idle > inner.options.stale_after {
                    warn!(event = "stream_stale", idle_ms = idle.as_millis() as u64);
                }
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        if cancel.is_cancelled() {
                            return ReadOutcome::Cancelled;
                        }
                        match frame {
                            Frame::EndOfStream => return ReadOutcome::EndOfStream,
                            Frame::Payload(text) => {
                                last_event = Instant::now();
                                handle_payload(inner, cancel, &text);
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(event = "stream_read_error", error = %err);
                    return ReadOutcome::TransportFailed;
                }
                None => return ReadOutcome::EndOfStream,
            }
        }
    }
}

/// Parses one payload line; malformed payloads are logged and skipped and
/// never terminate the read loop.
fn handle_payload(inner: &Inner, cancel: &CancellationToken, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "payload_parse_failed", error = %err);
            return;
        }
    };
    match EventRecord::from_value(value) {
        Ok(record) => deliver(inner, cancel, record),
        Err(err) => warn!(event = "record_rejected", error = %err),
    }
}

/// Hands a validated record to the dispatcher, buffering while no subscriber
/// is registered. Records from a superseded session are dropped.
fn deliver(inner: &Inner, cancel: &CancellationToken, record: EventRecord) {
    if cancel.is_cancelled() {
        return;
    }

    if inner.dispatcher.subscriber_count() == 0 {
        let mut state = inner.state();
        if cancel.is_cancelled() {
            return;
        }
        if state.buffer.len() >= inner.options.buffer_capacity {
            state.buffer.pop_front();
        }
        state.buffer.push_back(record);
        return;
    }

    let backlog: Vec<EventRecord> = {
        let mut state = inner.state();
        if cancel.is_cancelled() {
            return;
        }
        state.buffer.drain(..).collect()
    };
    // Re-check between records: a disconnect() racing the drain must not let
    // the superseded session keep reaching listeners.
    for earlier in &backlog {
        if cancel.is_cancelled() {
            return;
        }
        inner.dispatcher.dispatch_record(earlier);
    }
    if cancel.is_cancelled() {
        return;
    }
    inner.dispatcher.dispatch_record(&record);
}

fn mark_open(inner: &Inner, cancel: &CancellationToken) -> bool {
    let mut state = inner.state();
    if cancel.is_cancelled() {
        return false;
    }
    state.phase = ConnectionState::Open;
    state.connected_at = Some(Instant::now());
    state.reconnect_attempts = 0;
    true
}

fn mark_closed(inner: &Inner, cancel: &CancellationToken) {
    let mut state = inner.state();
    if cancel.is_cancelled() {
        // disconnect() already transitioned this session.
        return;
    }
    state.phase = ConnectionState::Closed;
    state.connected_at = None;
}
