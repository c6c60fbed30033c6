//! Widget list storage
//!
//! The list is kept in memory and mirrored to `widgets.toml` after every change.
//! Every successful change is published on a `watch` channel; the reconciliation
//! loop is its main subscriber.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::{load_toml, save_toml, StoreError, Widget, WidgetId};
use crate::mqtt::topic;

pub const MAX_WIDGETS: usize = 5;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
struct WidgetFile {
    next_id: WidgetId,
    widgets: Vec<Widget>,
}

impl Default for WidgetFile {
    fn default() -> Self {
        Self {
            next_id: 1,
            widgets: Vec::new(),
        }
    }
}

pub struct WidgetStore {
    path: Option<PathBuf>,
    file: Mutex<WidgetFile>,
    tx: watch::Sender<Vec<Widget>>,
}

impl WidgetStore {
    /// Loads the widget list from `path`, starting empty if the file is missing
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file: WidgetFile = load_toml(&path).await?;

        // Hand-edited files may carry ids past the counter
        let highest = file.widgets.iter().map(|w| w.id).max().unwrap_or(0);
        file.next_id = file.next_id.max(highest + 1);

        if file.widgets.len() > MAX_WIDGETS {
            warn!(
                "{} holds {} widgets, more than the limit of {}",
                path.display(),
                file.widgets.len(),
                MAX_WIDGETS
            );
        }
        info!("Loaded {} widgets from {}", file.widgets.len(), path.display());
        Ok(Self::with_file(Some(path), file))
    }

    pub fn in_memory() -> Self {
        Self::with_file(None, WidgetFile::default())
    }

    fn with_file(path: Option<PathBuf>, file: WidgetFile) -> Self {
        let (tx, _) = watch::channel(file.widgets.clone());
        Self {
            path,
            file: Mutex::new(file),
            tx,
        }
    }

    pub fn list(&self) -> Vec<Widget> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Widget>> {
        self.tx.subscribe()
    }

    /// Adds a widget and returns it with its assigned id
    pub async fn add(
        &self,
        display_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Widget, StoreError> {
        let display_name = display_name.into().trim().to_string();
        let topic = topic.into().trim().to_string();
        if display_name.is_empty() {
            return Err(StoreError::InvalidWidget("name must not be empty".to_string()));
        }
        topic::validate_filter(&topic).map_err(StoreError::InvalidWidget)?;

        let mut file = self.file.lock().await;
        if file.widgets.len() >= MAX_WIDGETS {
            warn!("Rejecting widget {}: limit of {} reached", display_name, MAX_WIDGETS);
            return Err(StoreError::LimitReached(MAX_WIDGETS));
        }

        let widget = Widget::new(file.next_id, display_name, topic);
        let mut next = file.clone();
        next.next_id += 1;
        next.widgets.push(widget.clone());

        self.commit(&mut file, next).await?;
        info!("Added widget {}", widget);
        Ok(widget)
    }

    /// Removes the widget with `id`; `Ok(None)` if there was none
    pub async fn delete(&self, id: WidgetId) -> Result<Option<Widget>, StoreError> {
        let mut file = self.file.lock().await;
        let Some(position) = file.widgets.iter().position(|w| w.id == id) else {
            return Ok(None);
        };

        let mut next = file.clone();
        let removed = next.widgets.remove(position);

        self.commit(&mut file, next).await?;
        info!("Deleted widget {}", removed);
        Ok(Some(removed))
    }

    /// Persists `next`, then makes it the visible list
    async fn commit(&self, current: &mut WidgetFile, next: WidgetFile) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            save_toml(path, "widget list", &next).await?;
        }
        *current = next;
        self.tx.send_replace(current.widgets.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fifth_widget_is_accepted_and_sixth_rejected() {
        let store = WidgetStore::in_memory();
        for n in 0..MAX_WIDGETS {
            store.add(format!("w{}", n), format!("t/{}", n)).await.unwrap();
        }
        let result = store.add("extra", "t/extra").await;
        assert!(matches!(result, Err(StoreError::LimitReached(5))));
        assert_eq!(store.list().len(), MAX_WIDGETS);
    }

    #[tokio::test]
    async fn invalid_widgets_are_rejected() {
        let store = WidgetStore::in_memory();
        assert!(matches!(
            store.add("  ", "a").await,
            Err(StoreError::InvalidWidget(_))
        ));
        assert!(matches!(
            store.add("name", "").await,
            Err(StoreError::InvalidWidget(_))
        ));
        assert!(matches!(
            store.add("name", "a/#/b").await,
            Err(StoreError::InvalidWidget(_))
        ));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn changes_are_published_on_watch() {
        let store = WidgetStore::in_memory();
        let mut rx = store.watch();

        let widget = store.add("Temperature", "sensor/temp").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![widget.clone()]);

        assert_eq!(store.delete(widget.id).await.unwrap(), Some(widget));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn deleting_unknown_id_changes_nothing() {
        let store = WidgetStore::in_memory();
        let mut rx = store.watch();
        assert_eq!(store.delete(42).await.unwrap(), None);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("widgets.toml");

        let store = WidgetStore::open(&path).await.unwrap();
        let first = store.add("a", "a").await.unwrap();
        let second = store.add("b", "b").await.unwrap();
        store.delete(second.id).await.unwrap();
        drop(store);

        let reopened = WidgetStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(), vec![first.clone()]);
        let third = reopened.add("c", "c").await.unwrap();
        assert!(third.id > second.id);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("widgets.toml");
        tokio::fs::write(&path, "widgets = 3").await.unwrap();

        let result = WidgetStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Parse { .. })));
    }
}
