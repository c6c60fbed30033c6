//! # Session Manager
//!
//! Owns the single broker session of the process. All operations that touch the
//! transport handle go through one async mutex, so connect, disconnect, publish,
//! subscribe and unsubscribe never interleave on the wire.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──on_connect──► Connected
//!      ▲                        │                          │
//!      └────────failure─────────┘                          │
//!      ▲                                                   │
//!      └──── Closing ◄──────── disconnect / error ─────────┘
//!
//! any state ──connect(new generation)──► teardown ──► Connecting
//! ```
//!
//! With `auto_reconnect` set, a transport error while Connected moves the session
//! back to Connecting and keeps the handle; the transport retries on its own.
//!
//! ## Generations
//!
//! Every connect attempt (and every explicit disconnect) bumps a generation
//! counter. Transport callbacks arrive through an [`EventSink`] stamped with the
//! generation of the client that produced them. The dispatcher task drops any
//! event whose generation is not the current one, which makes callbacks of a
//! superseded client inert.

use chrono::Local;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionConfig, QoS};
use super::error::{
    ConnectError, DisconnectError, ErrorEvent, ErrorKind, PublishError, SessionError,
    SubscribeError, TeardownError, TransportError, UnsubscribeError,
};
use super::message_manager::MessageRouter;
use super::topic;
use super::transport::{
    ClientOptions, EventSink, TaggedEvent, Transport, TransportEvent, TransportHandle,
};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Notification of one actual state transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub generation: u64,
    pub state: SessionState,
}

/// Tuning knobs for the session manager
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Capacity of the transport event channel
    pub event_capacity: usize,
    /// Capacity of the state-change and error broadcast channels
    pub notification_capacity: usize,
    /// Prefix of generated MQTT client ids
    pub client_id_prefix: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            notification_capacity: 64,
            client_id_prefix: "dashboard".to_string(),
        }
    }
}

struct PendingConnect {
    generation: u64,
    tx: oneshot::Sender<Result<(), ConnectError>>,
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    generation: u64,
    handle: Option<Box<dyn TransportHandle>>,
    config: Option<ConnectionConfig>,
    pending: Option<PendingConnect>,
}

pub struct SessionManager {
    inner: Mutex<SessionInner>,
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    events_tx: mpsc::Sender<TaggedEvent>,
    state_tx: watch::Sender<SessionState>,
    changes: broadcast::Sender<StateChange>,
    errors: broadcast::Sender<ErrorEvent>,
    client_id_prefix: String,
    connection_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Creates the manager and spawns its event dispatcher
    ///
    /// Must be called inside a tokio runtime. The dispatcher stops when the
    /// manager is dropped or [`shutdown`](Self::shutdown) is called.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        router: Arc<MessageRouter>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(settings.event_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (changes, _) = broadcast::channel(settings.notification_capacity.max(1));
        let (errors, _) = broadcast::channel(settings.notification_capacity.max(1));
        let shutdown = CancellationToken::new();

        let manager = Arc::new(Self {
            inner: Mutex::new(SessionInner::default()),
            transport,
            router,
            events_tx,
            state_tx,
            changes,
            errors,
            client_id_prefix: settings.client_id_prefix,
            connection_epoch: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(dispatch_events(
            Arc::downgrade(&manager),
            events_rx,
            shutdown,
        ));
        info!("Session manager started");
        manager
    }

    /// Connects to the broker described by `config`
    ///
    /// Any existing session is torn down first; teardown failures are logged and
    /// ignored. Resolves once the transport reports the outcome of this attempt,
    /// or with [`ConnectError::Superseded`] if another connect replaces it. There
    /// is no timeout: a silent broker keeps the session Connecting until
    /// [`disconnect`](Self::disconnect) is called.
    ///
    /// State only changes after the last transport await, so dropping this future
    /// halfway leaves the session Disconnected.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        if let Err(reason) = config.validate() {
            warn!("Rejecting connect request: {}", reason);
            self.report(ErrorKind::Connect, reason.clone());
            return Err(ConnectError::InvalidConfig(reason));
        }
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::ShutDown);
        }

        let waiter = {
            let mut inner = self.inner.lock().await;

            if let Err(e) = self.teardown(&mut inner, ConnectError::Superseded).await {
                warn!("Ignoring failed teardown before reconnect: {}", e);
            }

            inner.generation += 1;
            let generation = inner.generation;

            let options = ClientOptions::from_config(&config, self.client_id(generation));
            info!(
                "Connecting to {} as {} (generation {})",
                config, options.client_id, generation
            );
            let sink = EventSink::new(generation, self.events_tx.clone());

            let mut handle = match self.transport.create_client(options, sink).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Failed to create broker client: {}", e);
                    self.report(ErrorKind::Connect, e.to_string());
                    return Err(ConnectError::Rejected(e));
                }
            };

            if let Err(e) = handle.connect().await {
                error!("Failed to start connection: {}", e);
                if let Err(teardown) = handle.disconnect().await {
                    debug!("Ignoring teardown of failed client: {}", teardown);
                }
                self.report(ErrorKind::Connect, e.to_string());
                return Err(ConnectError::Rejected(e));
            }

            // Callbacks of this client queue behind the lock until it is released
            let (tx, rx) = oneshot::channel();
            inner.pending = Some(PendingConnect { generation, tx });
            inner.handle = Some(handle);
            inner.config = Some(config);
            self.set_state(&mut inner, SessionState::Connecting);
            rx
        };

        waiter.await.unwrap_or(Err(ConnectError::ShutDown))
    }

    /// Closes the session; a no-op when already Disconnected
    ///
    /// The handle is always released and the state always ends Disconnected,
    /// a failing transport teardown is only reported through the return value.
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Disconnected && inner.handle.is_none() {
            debug!("Disconnect requested while already disconnected");
            return Ok(());
        }

        info!("Disconnecting (generation {})", inner.generation);
        let result = self.teardown(&mut inner, ConnectError::Aborted).await;
        inner.generation += 1;
        result.map_err(DisconnectError::from)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let mut inner = self.inner.lock().await;
        let handle = connected_handle(&mut inner)?;
        topic::validate_topic(topic).map_err(SessionError::InvalidTopic)?;

        match handle.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                debug!("Published {} bytes to {}", payload.len(), topic);
                Ok(())
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                Err(e.into())
            }
        }
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SubscribeError> {
        let mut inner = self.inner.lock().await;
        let handle = connected_handle(&mut inner)?;
        topic::validate_filter(filter).map_err(SessionError::InvalidTopic)?;

        handle.subscribe(filter, qos).await.map_err(|e| {
            warn!("Subscribe to {} failed: {}", filter, e);
            SessionError::from(e)
        })?;
        info!("Subscribed to {}", filter);
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), UnsubscribeError> {
        let mut inner = self.inner.lock().await;
        let handle = connected_handle(&mut inner)?;

        handle.unsubscribe(filter).await.map_err(|e| {
            warn!("Unsubscribe from {} failed: {}", filter, e);
            SessionError::from(e)
        })?;
        info!("Unsubscribed from {}", filter);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Number of transitions into Connected so far
    ///
    /// Changes whenever the broker may have lost subscriptions, including
    /// transport-level reconnects within one generation.
    pub fn connection_epoch(&self) -> u64 {
        self.connection_epoch.load(Ordering::Acquire)
    }

    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Config of the live session, if any
    pub async fn active_config(&self) -> Option<ConnectionConfig> {
        self.inner.lock().await.config.clone()
    }

    /// Ordered stream of state transitions
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Latest state only, for consumers that do not need every transition
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Publishes an error event to the UI collaborator
    pub fn report(&self, kind: ErrorKind, message: impl Into<String>) {
        let event = ErrorEvent::new(kind, message);
        debug!("Reporting error event: {}", event);
        // Nobody listening is not an error
        let _ = self.errors.send(event);
    }

    /// Disconnects and stops the dispatcher
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            warn!("Ignoring teardown failure during shutdown: {}", e);
        }
        self.shutdown.cancel();
        info!("Session manager shut down");
    }

    fn client_id(&self, generation: u64) -> String {
        let stamp = Local::now().timestamp_subsec_nanos();
        format!("{}-{:08x}{:x}", self.client_id_prefix, stamp, generation)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state == state {
            return;
        }
        info!(
            "Session {} -> {} (generation {})",
            inner.state, state, inner.generation
        );
        inner.state = state;
        if state == SessionState::Connected {
            self.connection_epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.state_tx.send_replace(state);
        let _ = self.changes.send(StateChange {
            generation: inner.generation,
            state,
        });
    }

    /// Releases the handle and ends Disconnected
    ///
    /// A pending connect waiter is resolved with `pending_outcome`.
    async fn teardown(
        &self,
        inner: &mut SessionInner,
        pending_outcome: ConnectError,
    ) -> Result<(), TeardownError> {
        if let Some(pending) = inner.pending.take() {
            debug!(
                "Resolving pending connect of generation {} with: {}",
                pending.generation, pending_outcome
            );
            let _ = pending.tx.send(Err(pending_outcome));
        }
        inner.config = None;

        let Some(mut handle) = inner.handle.take() else {
            self.set_state(inner, SessionState::Disconnected);
            return Ok(());
        };

        self.set_state(inner, SessionState::Closing);
        let result = handle.disconnect().await.map_err(TeardownError::from);
        drop(handle);
        self.set_state(inner, SessionState::Disconnected);

        if let Err(e) = &result {
            warn!("{}", e);
        }
        result
    }

    async fn handle_event(&self, tagged: TaggedEvent) {
        let mut inner = self.inner.lock().await;
        if tagged.generation != inner.generation || inner.handle.is_none() {
            debug!(
                "Ignoring {:?} from stale generation {} (current {})",
                event_label(&tagged.event),
                tagged.generation,
                inner.generation
            );
            return;
        }

        match tagged.event {
            TransportEvent::Connected => {
                if inner.state != SessionState::Connecting {
                    debug!("Ignoring connect callback in state {}", inner.state);
                    return;
                }
                self.set_state(&mut inner, SessionState::Connected);
                if let Some(pending) = inner.pending.take() {
                    let _ = pending.tx.send(Ok(()));
                }
            }
            TransportEvent::Closed => {
                self.connection_lost(&mut inner, "Connection closed by broker".to_string())
                    .await;
            }
            TransportEvent::Error(message) => {
                self.connection_lost(&mut inner, message).await;
            }
            TransportEvent::Message { topic, payload } => {
                drop(inner);
                self.router.route(&topic, &payload).await;
            }
        }
    }

    async fn connection_lost(&self, inner: &mut SessionInner, reason: String) {
        if let Some(pending) = inner.pending.take() {
            warn!(
                "Connect attempt of generation {} failed: {}",
                pending.generation, reason
            );
            self.report(ErrorKind::Connect, reason.clone());
            let _ = pending
                .tx
                .send(Err(ConnectError::Rejected(TransportError::new(reason))));
            if let Err(e) = self.teardown(inner, ConnectError::Aborted).await {
                debug!("Ignoring teardown of failed client: {}", e);
            }
            inner.generation += 1;
            return;
        }

        let auto_reconnect = inner
            .config
            .as_ref()
            .is_some_and(|config| config.auto_reconnect);

        let state = inner.state;
        match state {
            SessionState::Connected if auto_reconnect => {
                warn!("Connection lost, waiting for transport to reconnect: {}", reason);
                self.report(ErrorKind::Transport, reason);
                self.set_state(inner, SessionState::Connecting);
            }
            SessionState::Connecting if auto_reconnect => {
                debug!("Reconnect attempt failed: {}", reason);
            }
            SessionState::Connected | SessionState::Connecting => {
                warn!("Connection lost: {}", reason);
                self.report(ErrorKind::Transport, reason);
                if let Err(e) = self.teardown(inner, ConnectError::Aborted).await {
                    debug!("Ignoring teardown of lost client: {}", e);
                }
                inner.generation += 1;
            }
            SessionState::Disconnected | SessionState::Closing => {
                debug!("Ignoring transport failure in state {}: {}", state, reason);
            }
        }
    }
}

fn connected_handle(
    inner: &mut SessionInner,
) -> Result<&mut Box<dyn TransportHandle>, SessionError> {
    if inner.state != SessionState::Connected {
        return Err(SessionError::NotConnected);
    }
    inner.handle.as_mut().ok_or(SessionError::NotConnected)
}

fn event_label(event: &TransportEvent) -> &'static str {
    match event {
        TransportEvent::Connected => "connect callback",
        TransportEvent::Closed => "close callback",
        TransportEvent::Error(_) => "error callback",
        TransportEvent::Message { .. } => "message",
    }
}

async fn dispatch_events(
    manager: Weak<SessionManager>,
    mut events: mpsc::Receiver<TaggedEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let tagged = tokio::select! {
            _ = shutdown.cancelled() => break,
            tagged = events.recv() => match tagged {
                Some(tagged) => tagged,
                None => break,
            },
        };

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(tagged).await;
    }
    debug!("Session event dispatcher stopped");
}
