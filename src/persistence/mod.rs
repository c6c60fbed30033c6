//! # Persistence Module
//!
//! ## Why This Module Exists
//! The dashboard keeps two pieces of user state between runs: the widget list and
//! the last broker connection. Both live as small TOML files in the data
//! directory and are written with `tokio::fs`.
//!
//! ## Key Abstractions
//! - **WidgetStore**: the widget list with its 5-widget cap and a `watch` channel
//!   the reconciliation loop observes
//! - **ConfigStore**: the saved [`ConnectionConfig`](crate::mqtt::config::ConnectionConfig)
//!
//! ## Error Handling Strategy
//! Store operations return [`StoreError`]. A missing file is not an error and
//! yields the default value, so a fresh install starts with no widgets and an
//! empty connection form.
//!
//! Stores built with `in_memory` never touch the filesystem.

pub mod config_store;
pub mod widget_store;

pub use config_store::ConfigStore;
pub use widget_store::{WidgetStore, MAX_WIDGETS};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub type WidgetId = u64;

/// A named dashboard tile bound to one topic filter
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Widget {
    pub id: WidgetId,
    pub display_name: String,
    pub topic: String,
}

impl Widget {
    pub fn new(id: WidgetId, display_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for Widget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} {} ({})", self.id, self.display_name, self.topic)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Widget limit reached, at most {0} widgets are allowed")]
    LimitReached(usize),

    #[error("Invalid widget: {0}")]
    InvalidWidget(String),

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: toml::ser::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Reads a TOML file, falling back to `T::default()` when it does not exist
pub(crate) async fn load_toml<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if !exists {
        debug!("{} does not exist yet, using defaults", path.display());
        return Ok(T::default());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `value` as pretty TOML, creating parent directories as needed
pub(crate) async fn save_toml<T>(path: &Path, what: &'static str, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let content =
        toml::to_string_pretty(value).map_err(|source| StoreError::Serialize { what, source })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Saved {} to {}", what, path.display());
    Ok(())
}
