//! Saved broker connection
//!
//! Holds the connection the user last saved, mirrored to `connection.toml`.

use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

use super::{load_toml, save_toml, StoreError};
use crate::mqtt::config::ConnectionConfig;

pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<ConnectionConfig>,
}

impl ConfigStore {
    /// Loads the saved connection, using `fallback` when no file exists yet
    pub async fn open(
        path: impl AsRef<Path>,
        fallback: ConnectionConfig,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        let config = if exists {
            let config: ConnectionConfig = load_toml(&path).await?;
            info!("Loaded saved connection {}", config);
            config
        } else {
            fallback
        };

        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    pub async fn get(&self) -> ConnectionConfig {
        self.config.read().await.clone()
    }

    /// Stores `config`; it is not validated until the next connect attempt
    pub async fn save(&self, config: ConnectionConfig) -> Result<(), StoreError> {
        let mut current = self.config.write().await;
        save_toml(&self.path, "connection config", &config).await?;
        info!("Saved connection {}", config);
        *current = config;
        Ok(())
    }
}
