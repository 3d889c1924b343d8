//! Resilient channel client.
//!
//! A [`ChannelClient`] keeps one logical publish/subscribe connection to a
//! server-pushed event channel. A single driver task owns the transport, the
//! heartbeat interval and the reconnect timer; handlers run on that task in
//! the order frames arrive.
//!
//! ```ignore
//! let client = ChannelClient::new("ws://127.0.0.1:8080/ws", ChannelConfig::default())?;
//! client.on("new_log", |event| println!("{}", event.payload));
//! client.on(WILDCARD, |event| tracing::debug!(event_type = %event.event_type));
//! let _ = client.connect().await;
//! client.send(&serde_json::json!({"type": "subscribe", "topic": "bots"}));
//! client.close();
//! ```

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{SinkExt, StreamExt};
use fwdpanel_core::{
    EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_ERROR, EVENT_PARSE_ERROR, EVENT_RECONNECT_FAILED,
    EVENT_RECONNECTING, Envelope, EventKind, WILDCARD, decode_envelope, lifecycle_envelope,
    ping_frame, pong_frame,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout},
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    config::ChannelConfig,
    error::ChannelError,
    transport::{Connector, Transport, WsConnector},
};

/// Bound on the close handshake when tearing a session down.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const RAW_PREVIEW_CHARS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

impl Registry {
    fn insert(&mut self, event_type: &str, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(event_type.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&mut self, event_type: &str, id: SubscriptionId) -> bool {
        let Some(list) = self.handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(event_type);
        }
        removed
    }

    fn snapshot(&self, event_type: &str) -> Vec<Handler> {
        self.handlers
            .get(event_type)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }
}

struct DriverHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && !*self.shutdown_tx.borrow()
    }
}

struct Shared {
    url: String,
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_attempts: AtomicU32,
    manual_close: AtomicBool,
    /// Bumped for every driver spawned; only the newest driver may touch
    /// shared state on its way out.
    epoch: AtomicU64,
    last_error: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    registry: Mutex<Registry>,
    driver: Mutex<Option<DriverHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    shared: Arc<Shared>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = close_shared(&self.shared);
    }
}

/// Handle to one resilient channel connection. Clones share the connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("url", &self.inner.shared.url)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl ChannelClient {
    pub fn new(url: impl Into<String>, config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::with_connector(url, config, Arc::new(WsConnector))
    }

    pub fn with_connector(
        url: impl Into<String>,
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ChannelError> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|err| ChannelError::InvalidUrl {
            url: url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidUrl {
                url,
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        config
            .validate()
            .map_err(|err| ChannelError::InvalidConfig(err.to_string()))?;

        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let shared = Shared {
            url,
            config,
            connector,
            state_tx,
            reconnect_attempts: AtomicU32::new(0),
            manual_close: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            last_error: Mutex::new(None),
            outbound: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            driver: Mutex::new(None),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Opens the connection unless it is already open, opening, or being
    /// retried in the background.
    ///
    /// Resolves once the first attempt reaches OPEN, or fails with that
    /// attempt's error. A failure here does not stop the reconnect cycle.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let ready_rx = {
            let shared = self.shared();
            let mut driver = lock(&shared.driver);
            if driver.as_ref().is_some_and(DriverHandle::is_live) {
                return Ok(());
            }
            if let Some(stale) = driver.take() {
                stale.task.abort();
            }

            let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            shared.manual_close.store(false, Ordering::SeqCst);
            shared.reconnect_attempts.store(0, Ordering::SeqCst);
            shared.state_tx.send_replace(ConnectionState::Connecting);

            let (ready_tx, ready_rx) = oneshot::channel();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(run_driver(Arc::clone(shared), epoch, shutdown_rx, ready_tx));
            *driver = Some(DriverHandle { shutdown_tx, task });
            ready_rx
        };

        ready_rx.await.unwrap_or(Err(ChannelError::ManuallyClosed))
    }

    /// Serializes `payload` as JSON and sends it. Returns `false` when the
    /// connection is not OPEN; nothing is queued.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(text) => self.send_text(text),
            Err(err) => {
                warn!(url = %self.shared().url, "dropping unserializable outbound message: {err}");
                false
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let shared = self.shared();
        if *shared.state_tx.borrow() != ConnectionState::Open {
            debug!(url = %shared.url, "send while not open, message dropped");
            return false;
        }
        lock(&shared.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Registers `handler` for `event_type`. Use [`WILDCARD`] to receive every
    /// inbound message.
    pub fn on<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        lock(&self.shared().registry).insert(event_type, Arc::new(handler))
    }

    pub fn off(&self, event_type: &str, id: SubscriptionId) -> bool {
        lock(&self.shared().registry).remove(event_type, id)
    }

    /// Stops the heartbeat, cancels any pending reconnect and closes the
    /// socket. No connect attempt starts after this returns until
    /// [`ChannelClient::connect`] is called again.
    pub fn close(&self) {
        let _ = close_shared(self.shared());
    }

    /// Like [`ChannelClient::close`], then waits for the driver to flush
    /// queued sends and finish the close handshake (bounded by a 2 s grace).
    ///
    /// Use this before the runtime shuts down, otherwise the driver task is
    /// cancelled with messages still queued.
    pub async fn close_and_wait(&self) {
        let Some(task) = close_shared(self.shared()) else {
            return;
        };
        match task.await {
            Ok(()) => debug!(url = %self.shared().url, "channel driver finished"),
            Err(err) if err.is_panic() => {
                warn!(url = %self.shared().url, "channel driver panicked during close");
            }
            Err(_) => {}
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared().state_tx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state_tx.subscribe()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared().reconnect_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared().last_error).clone()
    }

    #[must_use]
    pub fn is_manually_closed(&self) -> bool {
        self.shared().manual_close.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared().url
    }
}

/// Signals the driver to stop and hands back its task so callers can join it.
fn close_shared(shared: &Shared) -> Option<JoinHandle<()>> {
    shared.manual_close.store(true, Ordering::SeqCst);
    let handle = lock(&shared.driver).take();

    if let Some(handle) = &handle {
        let _ = handle.shutdown_tx.send(true);
    }

    let driver_running = handle.as_ref().is_some_and(|h| !h.task.is_finished());
    shared.state_tx.send_modify(|state| {
        *state = if *state == ConnectionState::Open && driver_running {
            ConnectionState::Closing
        } else {
            ConnectionState::Closed
        };
    });
    lock(&shared.outbound).take();

    let handle = handle?;
    info!(url = %shared.url, "channel closed manually");
    Some(handle.task)
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

impl Shared {
    fn shutdown_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
        *shutdown_rx.borrow()
    }

    /// Moves to `next` unless the driver has been told to stop.
    fn transition(&self, shutdown_rx: &watch::Receiver<bool>, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if Self::shutdown_requested(shutdown_rx) || *state == next {
                return false;
            }
            *state = next;
            true
        });
        !Self::shutdown_requested(shutdown_rx)
    }

    /// Publishes the outbound queue and enters OPEN atomically with respect
    /// to `close()`.
    fn mark_open(
        &self,
        shutdown_rx: &watch::Receiver<bool>,
        outbound_tx: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut opened = false;
        self.state_tx.send_if_modified(|state| {
            if Self::shutdown_requested(shutdown_rx) {
                return false;
            }
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            *lock(&self.outbound) = Some(outbound_tx);
            *state = ConnectionState::Open;
            opened = true;
            true
        });
        opened
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn clear_outbound(&self, epoch: u64) {
        if self.is_current(epoch) {
            lock(&self.outbound).take();
        }
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }

    fn emit(&self, event_type: &str, fields: Map<String, Value>) {
        let envelope = lifecycle_envelope(event_type, fields);
        let handlers = lock(&self.registry).snapshot(event_type);
        for handler in &handlers {
            invoke(handler, &envelope);
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        let (specific, wildcard) = {
            let registry = lock(&self.registry);
            (
                registry.snapshot(&envelope.event_type),
                registry.snapshot(WILDCARD),
            )
        };
        for handler in specific.iter().chain(wildcard.iter()) {
            invoke(handler, envelope);
        }
    }
}

fn invoke(handler: &Handler, envelope: &Envelope) {
    if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
        warn!(event_type = %envelope.event_type, "channel handler panicked");
    }
}

fn field(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(key.to_owned(), value.into());
    fields
}

async fn run_driver(
    shared: Arc<Shared>,
    epoch: u64,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let policy = shared.config.reconnect.clone();

    loop {
        if Shared::shutdown_requested(&shutdown_rx)
            || !shared.transition(&shutdown_rx, ConnectionState::Connecting)
        {
            break;
        }

        info!(
            url = %shared.url,
            attempt = shared.reconnect_attempts.load(Ordering::SeqCst),
            "connecting"
        );

        let attempt = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            attempt = timeout(shared.config.connect_timeout, shared.connector.connect(&shared.url)) => attempt,
        };

        let outcome = match attempt {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChannelError::ConnectTimeout(shared.config.connect_timeout)),
        };

        match outcome {
            Ok(transport) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                if !shared.mark_open(&shutdown_rx, outbound_tx) {
                    break;
                }
                info!(url = %shared.url, "connected");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                shared.emit(EVENT_CONNECTED, field("url", shared.url.as_str()));

                let end = run_session(&shared, transport, &mut shutdown_rx, outbound_rx).await;
                shared.clear_outbound(epoch);
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped => {
                        warn!(url = %shared.url, "connection dropped");
                        shared.transition(&shutdown_rx, ConnectionState::Closed);
                        shared.emit(EVENT_DISCONNECTED, field("url", shared.url.as_str()));
                    }
                }
            }
            Err(err) => {
                warn!(url = %shared.url, "connect failed: {err}");
                shared.record_error(err.to_string());
                shared.transition(&shutdown_rx, ConnectionState::Closed);
                shared.emit(EVENT_ERROR, field("error", err.to_string()));
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }

        if Shared::shutdown_requested(&shutdown_rx) {
            break;
        }

        let attempts = shared.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= policy.max_attempts {
            warn!(
                url = %shared.url,
                max_attempts = policy.max_attempts,
                "giving up after max reconnect attempts"
            );
            shared.transition(&shutdown_rx, ConnectionState::Closed);
            shared.emit(EVENT_RECONNECT_FAILED, field("attempts", attempts));
            return;
        }

        let attempt = attempts + 1;
        shared.reconnect_attempts.store(attempt, Ordering::SeqCst);
        let delay = policy.next_delay(attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(url = %shared.url, attempt, delay_ms, "reconnect scheduled");
        let mut fields = field("attempt", attempt);
        fields.insert("delay_ms".to_owned(), Value::from(delay_ms));
        shared.emit(EVENT_RECONNECTING, fields);

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            () = sleep(delay) => {}
        }
    }

    if shared.is_current(epoch) {
        shared.clear_outbound(epoch);
        shared.state_tx.send_replace(ConnectionState::Closed);
    }
}

async fn run_session(
    shared: &Shared,
    transport: Transport,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) -> SessionEnd {
    let Transport {
        mut sink,
        mut stream,
    } = transport;
    let config = &shared.config;
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_overdue = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                // Messages accepted by `send` before `close` still go out.
                let flush = async {
                    while let Ok(text) = outbound_rx.try_recv() {
                        if sink.send(text).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink.close().await;
                };
                let _ = timeout(CLOSE_GRACE, flush).await;
                return SessionEnd::Shutdown;
            }
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    if let Some(envelope) = handle_frame(shared, &text) {
                        match envelope.kind() {
                            EventKind::Pong => {
                                trace!(url = %shared.url, timestamp = ?envelope.timestamp_ms(), "pong");
                                pong_deadline = None;
                            }
                            EventKind::Ping => {
                                let reply = pong_frame(envelope.timestamp_ms().unwrap_or_else(now_unix_ms));
                                if let Err(err) = sink.send(reply).await {
                                    shared.record_error(err.to_string());
                                    return SessionEnd::Dropped;
                                }
                            }
                            _ => {}
                        }
                        shared.dispatch(&envelope);
                    }
                }
                Some(Err(err)) => {
                    // The stream ends right after an error; that end drives the reconnect.
                    warn!(url = %shared.url, "transport error: {err}");
                    shared.record_error(err.to_string());
                    shared.emit(EVENT_ERROR, field("error", err.to_string()));
                }
                None => return SessionEnd::Dropped,
            },
            Some(text) = outbound_rx.recv() => {
                if let Err(err) = sink.send(text).await {
                    warn!(url = %shared.url, "send failed: {err}");
                    shared.record_error(err.to_string());
                    return SessionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                debug!(url = %shared.url, "ping");
                if let Err(err) = sink.send(ping_frame(now_unix_ms())).await {
                    warn!(url = %shared.url, "heartbeat send failed: {err}");
                    shared.record_error(err.to_string());
                    return SessionEnd::Dropped;
                }
                if let Some(wait) = config.pong_timeout {
                    pong_deadline.get_or_insert_with(|| Instant::now() + wait);
                }
            }
            () = pong_overdue => {
                warn!(url = %shared.url, "no pong within {:?}, forcing reconnect", config.pong_timeout);
                shared.record_error("heartbeat timed out".to_owned());
                let _ = timeout(CLOSE_GRACE, sink.close()).await;
                return SessionEnd::Dropped;
            }
        }
    }
}

fn handle_frame(shared: &Shared, text: &str) -> Option<Envelope> {
    match decode_envelope(text) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(url = %shared.url, "failed to parse channel message: {err}");
            shared.record_error(err.to_string());
            let mut fields = field("error", err.to_string());
            fields.insert(
                "raw".to_owned(),
                Value::from(preview_text(text, RAW_PREVIEW_CHARS)),
            );
            shared.emit(EVENT_PARSE_ERROR, fields);
            None
        }
    }
}

fn preview_text(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
