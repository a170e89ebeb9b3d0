//! WebSocket event-stream client for the event broker.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, bounded fixed-delay reconnect)
//! - Subscribe/unsubscribe control messages
//! - Fan-out dispatch of inbound events to the [`HandlerRegistry`]
//!
//! One client owns at most one live connection. Frames from that connection
//! are read by a single task and dispatched in arrival order.
//!
//! ```text
//!  connect() ──► Connecting ──► Connected ──(close/error)──► Disconnected
//!                    │                                          │
//!                    └──(open fails)──► Disconnected ◄──────────┘
//!                                          │  attempts < max: sleep(interval), connect()
//!                                          └─ attempts ≥ max: Error (no more retries)
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::CollabConfig;
use crate::error::{CollabError, HandlerError};
use crate::protocol::{ClientMessage, Event, EventType, ServerMessage};
use crate::registry::{DispatchReport, HandlerRegistry, ListenerHandle, Topic};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only an explicit `connect()` retries.
    Error,
}

impl ConnectionState {
    /// Whether collaborative affordances should show as offline.
    pub fn is_offline(self) -> bool {
        self != ConnectionState::Connected
    }
}

/// What to do after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Bounded, fixed-interval reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts, attempts: 0 }
    }

    /// Record an unexpected close and decide whether to retry.
    pub fn on_close(&mut self) -> ReconnectDecision {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
            ReconnectDecision::Retry { attempt: self.attempts, delay: self.interval }
        } else {
            ReconnectDecision::GiveUp
        }
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Connection bookkeeping guarded by one mutex.
///
/// `generation` increments on every connect and disconnect; tasks belonging
/// to an older generation are ignored when they report a close.
struct Link {
    policy: ReconnectPolicy,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    subscriptions: BTreeSet<String>,
}

struct Inner {
    broker_url: String,
    user_id: Mutex<Option<String>>,
    registry: HandlerRegistry,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn connect(self: &Arc<Self>) -> Result<(), CollabError> {
        let Some(user_id) = self.user_id() else {
            log::debug!("connect() skipped: no authenticated user");
            return Ok(());
        };

        let generation = {
            let mut link = self.link();
            let current = *self.state.borrow();
            if matches!(current, ConnectionState::Connected | ConnectionState::Connecting) {
                return Ok(());
            }
            if let Some(timer) = link.reconnect_timer.take() {
                timer.abort();
            }
            link.generation += 1;
            self.set_state(ConnectionState::Connecting);
            link.generation
        };

        let url = format!("{}/ws/{}", self.broker_url.trim_end_matches('/'), user_id);
        log::info!("Connecting to event broker at {url}");

        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Event broker connection to {url} failed: {e}");
                self.on_connection_lost(generation);
                return Err(e.into());
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let subscriptions = {
            let mut link = self.link();
            if link.generation != generation {
                None
            } else {
                link.outgoing = Some(out_tx.clone());
                link.policy.reset();
                self.set_state(ConnectionState::Connected);

                // Reader task: dispatch inbound frames in arrival order
                let inner = Arc::clone(self);
                link.reader = Some(tokio::spawn(async move {
                    while let Some(frame) = ws_reader.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                inner.handle_frame(text.as_str());
                            }
                            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                                Ok(text) => {
                                    inner.handle_frame(text);
                                }
                                Err(_) => log::warn!("Dropping non-UTF-8 binary frame"),
                            },
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                log::warn!("Event stream read error: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                    inner.on_connection_lost(generation);
                }));

                Some(link.subscriptions.iter().cloned().collect::<Vec<_>>())
            }
        };

        let Some(subscriptions) = subscriptions else {
            // disconnect() won the race with the handshake
            let _ = ws_writer.close().await;
            return Ok(());
        };

        // Writer task: forward control messages; closing the channel closes the socket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode control message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        log::info!("Connected to event broker as {user_id}");
        if !subscriptions.is_empty() {
            let _ = out_tx.send(ClientMessage::Subscribe { event_types: subscriptions });
        }
        Ok(())
    }

    /// Handle an unexpected close (or failed open) of connection `generation`.
    fn on_connection_lost(self: &Arc<Self>, generation: u64) {
        let mut link = self.link();
        if link.generation != generation {
            return;
        }
        link.outgoing = None;
        link.reader = None;

        match link.policy.on_close() {
            ReconnectDecision::Retry { attempt, delay } => {
                log::info!(
                    "Event stream lost; reconnect attempt {attempt}/{} in {delay:?}",
                    link.policy.max_attempts()
                );
                self.set_state(ConnectionState::Disconnected);
                let inner = Arc::clone(self);
                link.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.link().reconnect_timer = None;
                    if let Err(e) = inner.connect().await {
                        log::debug!("Reconnect attempt failed: {e}");
                    }
                }));
            }
            ReconnectDecision::GiveUp => {
                log::error!(
                    "Event stream unavailable after {} reconnect attempts; giving up",
                    link.policy.attempts()
                );
                self.set_state(ConnectionState::Error);
            }
        }
    }

    /// Stop the reconnect timer and the reader, close the socket.
    fn shutdown(&self) {
        let mut link = self.link();
        link.generation += 1;
        if let Some(timer) = link.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        // Dropping the sender ends the writer task, which closes the socket
        link.outgoing = None;
        link.policy.reset();
        self.set_state(ConnectionState::Disconnected);
        log::info!("Disconnected from event broker");
    }

    fn handle_frame(&self, text: &str) -> Option<DispatchReport> {
        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed broker frame: {e}");
                return None;
            }
        };
        match msg {
            ServerMessage::SubscriptionConfirmed { event_types } => {
                log::debug!("Broker confirmed {} subscriptions", event_types.len());
                None
            }
            ServerMessage::Unknown => {
                log::trace!("Ignoring unknown broker frame");
                None
            }
            frame => frame.into_event().map(|event| {
                log::trace!("Dispatching {} ({})", event.event_type, event.id);
                self.registry.dispatch(&event)
            }),
        }
    }
}

/// Tears the connection down once the last client handle is gone.
///
/// Background tasks hold `Arc<Inner>` but never this guard.
struct Owner(Arc<Inner>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// The event-stream client.
///
/// Cheap to clone; clones share the connection, the registry and the state.
/// Dropping the last clone disconnects.
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<Inner>,
    _owner: Arc<Owner>,
}

impl EventStreamClient {
    /// Create a client; nothing connects until [`connect`](Self::connect).
    pub fn new(config: &CollabConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            broker_url: config.broker_url.clone(),
            user_id: Mutex::new(None),
            registry: HandlerRegistry::new(),
            state,
            link: Mutex::new(Link {
                policy: ReconnectPolicy::new(config.reconnect_interval, config.max_reconnect_attempts),
                generation: 0,
                outgoing: None,
                reader: None,
                reconnect_timer: None,
                subscriptions: EventType::default_subscriptions().into_iter().collect(),
            }),
        });
        Self { _owner: Arc::new(Owner(Arc::clone(&inner))), inner }
    }

    /// Set the identity the connection is opened for.
    pub fn authenticate(&self, user_id: impl Into<String>) {
        *self.inner.user_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(user_id.into());
    }

    /// Forget the identity and tear the connection down.
    pub fn logout(&self) {
        self.inner.user_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        self.disconnect();
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id()
    }

    /// Open the connection.
    ///
    /// No-op when already connected/connecting or when no user is
    /// authenticated. A failed open schedules a reconnect and returns the
    /// error.
    pub async fn connect(&self) -> Result<(), CollabError> {
        self.inner.connect().await
    }

    /// Cancel any pending reconnect and close the connection.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// Ask the broker for more event types. Returns `false` (and does nothing)
    /// when not connected.
    pub fn subscribe<I, S>(&self, types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        let mut link = self.inner.link();
        if !self.send_control(&link, ClientMessage::Subscribe { event_types: types.clone() }) {
            return false;
        }
        link.subscriptions.extend(types);
        true
    }

    /// Stop receiving event types. Returns `false` when not connected.
    pub fn unsubscribe<I, S>(&self, types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        let mut link = self.inner.link();
        if !self.send_control(&link, ClientMessage::Unsubscribe { event_types: types.clone() }) {
            return false;
        }
        for t in &types {
            link.subscriptions.remove(t);
        }
        true
    }

    fn send_control(&self, link: &Link, msg: ClientMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            log::debug!("Not connected; dropping {msg:?}");
            return false;
        }
        match &link.outgoing {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Register a handler for one event type or `"*"`.
    pub fn add_event_listener<F>(&self, topic: impl Into<Topic>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.registry.register(topic, handler)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link().policy.attempts()
    }

    /// Event types that will be requested on the next (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.link().subscriptions.iter().cloned().collect()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn broker_url(&self) -> &str {
        &self.inner.broker_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(port: u16) -> CollabConfig {
        CollabConfig {
            broker_url: format!("ws://127.0.0.1:{port}"),
            reconnect_interval: Duration::from_millis(20),
            max_reconnect_attempts: 2,
            ..CollabConfig::default()
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_policy_bounded_retries() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(5000), 10);
        for expected in 1..=10 {
            assert_eq!(
                policy.on_close(),
                ReconnectDecision::Retry { attempt: expected, delay: Duration::from_millis(5000) }
            );
        }
        for _ in 0..5 {
            assert_eq!(policy.on_close(), ReconnectDecision::GiveUp);
        }
        assert_eq!(policy.attempts(), 10);
    }

    #[test]
    fn test_policy_fixed_interval() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(300), 3);
        let delays: Vec<Duration> = (0..3)
            .filter_map(|_| match policy.on_close() {
                ReconnectDecision::Retry { delay, .. } => Some(delay),
                ReconnectDecision::GiveUp => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(300); 3]);
    }

    #[test]
    fn test_policy_reset() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(10), 10);
        for _ in 0..7 {
            policy.on_close();
        }
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert!(matches!(policy.on_close(), ReconnectDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_policy_zero_attempts_gives_up_immediately() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(10), 0);
        assert_eq!(policy.on_close(), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_client_creation() {
        let client = EventStreamClient::new(&test_config(9));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.broker_url(), "ws://127.0.0.1:9");
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(client.subscriptions().len(), EventType::default_subscriptions().len());
        assert!(client.user_id().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_user_is_noop() {
        let client = EventStreamClient::new(&test_config(closed_port().await));
        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_when_disconnected_is_noop() {
        let client = EventStreamClient::new(&test_config(9));
        let before = client.subscriptions();
        assert!(!client.subscribe(["printer_jammed"]));
        assert!(!client.unsubscribe(["job_created"]));
        assert_eq!(client.subscriptions(), before);
    }

    #[tokio::test]
    async fn test_failed_open_retries_then_errors() {
        let client = EventStreamClient::new(&test_config(closed_port().await));
        client.authenticate("u1");
        let mut states = client.watch_state();

        assert!(client.connect().await.is_err());

        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while *states.borrow_and_update() != ConnectionState::Error {
                states.changed().await.unwrap();
            }
        })
        .await;
        assert!(reached.is_ok(), "client should give up");
        assert_eq!(client.reconnect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let config = CollabConfig { reconnect_interval: Duration::from_secs(60), ..test_config(closed_port().await) };
        let client = EventStreamClient::new(&config);
        client.authenticate("u1");

        let _ = client.connect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 1);

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(client.inner.link().reconnect_timer.is_none());
    }

    #[test]
    fn test_frame_dispatch_reaches_listeners() {
        let client = EventStreamClient::new(&test_config(9));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _h = client.add_event_listener(EventType::InventoryLowStock, move |event: &Event| {
            assert_eq!(event.payload["sku"], "PLA-1KG");
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let frame = r#"{"type":"event","event_type":"inventory_low_stock","event_id":"e9",
            "source":"inventory","payload":{"sku":"PLA-1KG"},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let report = client.inner.handle_frame(frame).unwrap();
        assert_eq!(report.invoked, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let client = EventStreamClient::new(&test_config(9));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _h = client.add_event_listener("*", move |_: &Event| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(client.inner.handle_frame("{\"type\":\"event\",").is_none());
        assert!(client.inner.handle_frame(r#"{"type":"subscription_confirmed","event_types":[]}"#).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_offline_flag() {
        assert!(ConnectionState::Disconnected.is_offline());
        assert!(ConnectionState::Error.is_offline());
        assert!(!ConnectionState::Connected.is_offline());
    }
}
