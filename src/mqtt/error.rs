//! Error types for the broker session and its collaborators
//!
//! Every error renders a plain-text message through `Display` so the UI layer can
//! show it without further formatting.

use std::fmt;

use thiserror::Error;

/// Opaque failure reported by the broker client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure while tearing down a session before a reconnect or on disconnect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Teardown failed: {0}")]
pub struct TeardownError(#[from] pub TransportError);

/// Errors returned to the direct caller of `connect`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Config failed validation, no connect attempt was made
    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    /// Broker unreachable, credentials rejected or the client could not be built
    #[error("Connection failed: {0}")]
    Rejected(#[from] TransportError),

    /// A newer connect call replaced this attempt
    #[error("Connection attempt superseded by a newer connect request")]
    Superseded,

    /// `disconnect` was called while the attempt was still pending
    #[error("Connection attempt aborted by disconnect")]
    Aborted,

    /// The session manager shut down before the attempt resolved
    #[error("Session manager is shut down")]
    ShutDown,
}

/// Errors from publish, subscribe and unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Operation attempted while the session is not Connected
    #[error("Not connected to a broker")]
    NotConnected,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type PublishError = SessionError;
pub type SubscribeError = SessionError;
pub type UnsubscribeError = SessionError;

/// Errors from `disconnect`; the session is Disconnected regardless
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectError {
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Category of an [`ErrorEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    NotConnected,
    Transport,
    Subscription,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ErrorKind::Connect => "connect",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::Transport => "transport",
            ErrorKind::Subscription => "subscription",
        };
        f.write_str(label)
    }
}

/// Error notification delivered to the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
