use serde::{Deserialize, Serialize};
use std::fmt;

/// Default keep-alive interval announced to the broker
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Transport security of the broker connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// `mqtt://`, plain TCP
    #[default]
    Plain,
    /// `mqtts://`, TLS
    Secure,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Plain => "mqtt",
            Protocol::Secure => "mqtts",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Plain => 1883,
            Protocol::Secure => 8883,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Protocol::Secure)
    }
}

/// Protocol revision shown next to the connection; the session always speaks
/// what the transport implements
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttVersion {
    #[default]
    V3,
    V5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Display for Credentials {
    /// Shows only the user name
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.username)
    }
}

/// Quality of service requested for a publish or subscribe
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("Invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Settings of the single broker connection
///
/// Stored by the connection-config store and handed to
/// [`SessionManager::connect`](super::session::SessionManager::connect), which
/// validates it before any transport call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub auto_reconnect: bool,
    pub keep_alive_secs: u64,
    pub version: MqttVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Plain,
            host: String::new(),
            port: Protocol::Plain.default_port(),
            credentials: None,
            auto_reconnect: true,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            version: MqttVersion::V3,
        }
    }
}

impl ConnectionConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Checks the invariants required before a connect attempt
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("Host must not be empty".to_string());
        }
        if self.host.contains("://") || self.host.contains('/') {
            return Err(format!(
                "Host '{}' must be a bare host name without scheme or path",
                self.host
            ));
        }
        if self.port == 0 {
            return Err("Port must be between 1 and 65535".to_string());
        }
        if self.keep_alive_secs == 0 {
            return Err("Keep-alive must be at least one second".to_string());
        }
        Ok(())
    }

    /// Credentials to send, present only when both fields are filled
    pub fn auth(&self) -> Option<&Credentials> {
        self.credentials
            .as_ref()
            .filter(|c| !c.username.is_empty() && !c.password.is_empty())
    }

    /// Renders `scheme://host:port`
    pub fn broker_uri(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host.trim(), self.port)
    }
}

impl fmt::Display for ConnectionConfig {
    /// Formats as `user@uri`, password excluded
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.auth() {
            Some(credentials) => write!(f, "{}@{}", credentials, self.broker_uri()),
            None => write!(f, "{}", self.broker_uri()),
        }
    }
}
