//! Process-wide settings
//!
//! Read once at startup from `settings.toml` in the data directory. A missing
//! file gives the defaults, so the dashboard runs without any setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mqtt::config::{ConnectionConfig, QoS, DEFAULT_KEEP_ALIVE_SECS};
use crate::mqtt::session::SessionSettings;

pub const SETTINGS_FILE: &str = "settings.toml";
pub const WIDGETS_FILE: &str = "widgets.toml";
pub const CONNECTION_FILE: &str = "connection.toml";

const APP_DIR: &str = "mqtt-dashboard";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the widget list and the saved connection
    pub data_dir: PathBuf,
    /// Keep-alive used for a connection that was never saved
    pub keep_alive_secs: u64,
    /// QoS of subscriptions issued for widgets
    pub subscribe_qos: QoS,
    pub event_capacity: usize,
    pub notification_capacity: usize,
    /// Outstanding requests the MQTT client buffers
    pub request_capacity: usize,
    /// Pause between reconnect attempts of the MQTT event loop
    pub reconnect_delay_ms: u64,
    pub client_id_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            subscribe_qos: QoS::AtMostOnce,
            event_capacity: 256,
            notification_capacity: 64,
            request_capacity: 100,
            reconnect_delay_ms: 1000,
            client_id_prefix: "rn-client".to_string(),
        }
    }
}

impl Settings {
    /// Loads `settings.toml` from the default data directory
    pub async fn load_default() -> Result<Self, SettingsError> {
        Self::load(default_data_dir().join(SETTINGS_FILE)).await
    }

    /// Loads settings from `path`, falling back to defaults when it is missing
    ///
    /// A relative `data_dir` is resolved against the directory of `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut settings: Settings =
            toml::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if settings.data_dir.is_relative() {
            if let Some(base) = path.parent() {
                settings.data_dir = base.join(&settings.data_dir);
            }
        }
        settings.validate()?;
        debug!("Loaded settings from {}: {:?}", path.display(), settings);
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.keep_alive_secs == 0 {
            return Err(SettingsError::Invalid(
                "keep_alive_secs must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 || self.notification_capacity == 0 || self.request_capacity == 0
        {
            return Err(SettingsError::Invalid(
                "channel capacities must be positive".to_string(),
            ));
        }
        if self.client_id_prefix.trim().is_empty() {
            warn!("Empty client id prefix, client ids will start with '-'");
        }
        Ok(())
    }

    pub fn widgets_path(&self) -> PathBuf {
        self.data_dir.join(WIDGETS_FILE)
    }

    pub fn connection_path(&self) -> PathBuf {
        self.data_dir.join(CONNECTION_FILE)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            event_capacity: self.event_capacity,
            notification_capacity: self.notification_capacity,
            client_id_prefix: self.client_id_prefix.clone(),
        }
    }

    /// Connection used until the user saves one
    pub fn default_connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_secs: self.keep_alive_secs,
            ..ConnectionConfig::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| {
            warn!("Could not determine a config directory, using the working directory");
            PathBuf::from(".")
        })
        .join(APP_DIR)
}
