//! Broker transport boundary
//!
//! The session manager never speaks the wire protocol itself. It asks a
//! [`Transport`] for a client handle and drives it through [`TransportHandle`].
//! Asynchronous lifecycle callbacks and inbound messages come back through an
//! [`EventSink`] that carries the generation of the connect attempt that created
//! the handle, so callbacks from a superseded client can be recognised and
//! dropped.
//!
//! ```text
//! SessionManager ──create_client/connect/publish/...──► TransportHandle
//!       ▲                                                     │
//!       └──── TaggedEvent { generation, event } ◄── EventSink ┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::config::{ConnectionConfig, Credentials, QoS};
use super::error::TransportError;

/// Everything the transport needs to build a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    pub client_id: String,
    pub credentials: Option<Credentials>,
}

impl ClientOptions {
    pub fn from_config(config: &ConnectionConfig, client_id: String) -> Self {
        Self {
            uri: config.broker_uri(),
            host: config.host.trim().to_string(),
            port: config.port,
            tls: config.protocol.is_tls(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            client_id,
            credentials: config.auth().cloned(),
        }
    }
}

/// Lifecycle callback or inbound message reported by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Closed,
    Error(String),
    Message { topic: String, payload: Vec<u8> },
}

/// A [`TransportEvent`] tagged with the connect generation that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Callback target handed to a client on creation
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn on_connect(&self) {
        self.emit(TransportEvent::Connected).await;
    }

    pub async fn on_close(&self) {
        self.emit(TransportEvent::Closed).await;
    }

    pub async fn on_error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into())).await;
    }

    pub async fn on_message(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.emit(TransportEvent::Message {
            topic: topic.into(),
            payload: payload.into(),
        })
        .await;
    }

    /// True once the session manager stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn emit(&self, event: TransportEvent) {
        let tagged = TaggedEvent {
            generation: self.generation,
            event,
        };
        if self.tx.send(tagged).await.is_err() {
            debug!(
                "Dropping transport event of generation {}: session manager gone",
                self.generation
            );
        }
    }
}

/// Factory for broker clients
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_client(
        &self,
        options: ClientOptions,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One broker client; owned exclusively by the session manager
///
/// `connect` only starts the attempt, its outcome arrives through the sink.
#[async_trait]
pub trait TransportHandle: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
