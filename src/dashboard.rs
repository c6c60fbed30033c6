//! # Dashboard
//!
//! The surface the UI talks to. It wires the session manager, the message router
//! and the reconciliation loop together and exposes them as one handle.
//!
//! ```text
//! Dashboard ──► SessionManager ──► Transport
//!     │               │
//!     │               └──► MessageRouter ──► widget_updates()
//!     └──► Reconciler (task) ◄── WidgetStore::watch()
//! ```
//!
//! Subscriptions made through [`Dashboard::subscribe`] are pinned: they live next
//! to the widget topics and are replayed after every reconnect until
//! [`Dashboard::unsubscribe`] drops them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mqtt::config::{ConnectionConfig, QoS};
use crate::mqtt::error::{
    ConnectError, DisconnectError, ErrorEvent, PublishError, SubscribeError, UnsubscribeError,
};
use crate::mqtt::message_manager::{MessageRouter, MqttMessage, WidgetMessage};
use crate::mqtt::reconcile::{spawn_reconciliation, Reconciler};
use crate::mqtt::registry::SubscriptionSet;
use crate::mqtt::session::{SessionManager, SessionSettings, SessionState, StateChange};
use crate::mqtt::transport::Transport;
use crate::persistence::{Widget, WidgetId};

#[derive(Clone, Debug)]
pub struct DashboardSettings {
    pub session: SessionSettings,
    /// QoS for widget and pinned subscriptions
    pub subscribe_qos: QoS,
    /// Capacity of the widget update broadcast
    pub update_capacity: usize,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            subscribe_qos: QoS::AtMostOnce,
            update_capacity: 64,
        }
    }
}

pub struct Dashboard {
    session: Arc<SessionManager>,
    router: Arc<MessageRouter>,
    reconciler: Arc<Mutex<Reconciler>>,
    subscribe_qos: QoS,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dashboard {
    /// Starts the session manager and the reconciliation loop
    ///
    /// Must be called inside a tokio runtime. `widgets` is usually
    /// [`WidgetStore::watch`](crate::persistence::WidgetStore::watch).
    pub fn start(
        transport: Arc<dyn Transport>,
        widgets: watch::Receiver<Vec<Widget>>,
        settings: DashboardSettings,
    ) -> Self {
        let router = Arc::new(MessageRouter::new(settings.update_capacity));
        let session = SessionManager::spawn(transport, router.clone(), settings.session);
        let reconciler = Arc::new(Mutex::new(Reconciler::new(
            session.clone(),
            router.clone(),
            settings.subscribe_qos,
        )));

        let shutdown = CancellationToken::new();
        let task = spawn_reconciliation(
            reconciler.clone(),
            widgets,
            session.state_changes(),
            shutdown.clone(),
        );
        info!("Dashboard started");

        Self {
            session,
            router,
            reconciler,
            subscribe_qos: settings.subscribe_qos,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        self.session.connect(config).await
    }

    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        self.session.disconnect().await
    }

    /// Publishes without the retain flag
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl AsRef<[u8]>,
        qos: QoS,
    ) -> Result<(), PublishError> {
        self.session
            .publish(topic, payload.as_ref(), qos, false)
            .await
    }

    /// Subscribes to `filter` outside the widget list and keeps it across reconnects
    pub async fn subscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        let mut reconciler = self.reconciler.lock().await;
        self.session.subscribe(filter, self.subscribe_qos).await?;
        reconciler.pin(filter).await;
        debug!("Pinned {}", filter);
        Ok(())
    }

    /// Drops a pinned filter
    ///
    /// A filter a widget still uses is subscribed again right away.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), UnsubscribeError> {
        let mut reconciler = self.reconciler.lock().await;
        self.session.unsubscribe(filter).await?;
        reconciler.unpin(filter).await;
        debug!("Unpinned {}", filter);
        Ok(())
    }

    /// Latest message per concrete topic
    pub async fn latest_messages(&self) -> HashMap<String, MqttMessage> {
        self.router.latest_messages().await
    }

    pub async fn latest_for_widget(&self, widget: WidgetId) -> Option<MqttMessage> {
        self.router.latest_for_widget(widget).await
    }

    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.session.state_changes()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.session.errors()
    }

    pub fn widget_updates(&self) -> broadcast::Receiver<WidgetMessage> {
        self.router.updates()
    }

    /// Active filters and the widgets behind each
    pub async fn subscription_set(&self) -> SubscriptionSet {
        self.reconciler.lock().await.subscription_set()
    }

    /// Stops the reconciliation loop and closes the session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Reconciliation task ended abnormally: {}", e);
            }
        }
        self.session.shutdown().await;
        info!("Dashboard shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::Protocol;
    use crate::mqtt::error::SessionError;
    use crate::mqtt::testing::{wait_until, MockTransport};
    use crate::persistence::WidgetStore;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(Protocol::Plain, "broker.local", 1883)
    }

    fn start(transport: &MockTransport, store: &WidgetStore) -> Dashboard {
        transport.set_auto_connect(true);
        Dashboard::start(
            Arc::new(transport.clone()),
            store.watch(),
            DashboardSettings::default(),
        )
    }

    #[tokio::test]
    async fn widget_messages_reach_the_widget() {
        let transport = MockTransport::new();
        let store = WidgetStore::in_memory();
        let temp = store.add("Temperature", "sensor/+/temp").await.unwrap();
        let dashboard = start(&transport, &store);
        let mut updates = dashboard.widget_updates();

        dashboard.connect(config()).await.unwrap();
        wait_until!(dashboard.subscription_set().await.contains_key("sensor/+/temp"));

        transport
            .wait_for_sink(1)
            .await
            .on_message("sensor/kitchen/temp", b"21.5".to_vec())
            .await;
        let update = updates.recv().await.unwrap();
        assert_eq!(update.widget, temp.id);
        assert_eq!(update.message.content, "21.5");
        assert_eq!(
            dashboard
                .latest_for_widget(temp.id)
                .await
                .map(|m| m.topic),
            Some("sensor/kitchen/temp".to_string())
        );

        dashboard.shutdown().await;
        assert_eq!(dashboard.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn pinned_subscription_is_replayed_after_reconnect() {
        let transport = MockTransport::new();
        let store = WidgetStore::in_memory();
        let dashboard = start(&transport, &store);

        dashboard.connect(config()).await.unwrap();
        dashboard.subscribe("debug/#").await.unwrap();
        assert!(dashboard.subscription_set().await.contains_key("debug/#"));

        dashboard.connect(config()).await.unwrap();
        wait_until!(transport.subscription_calls() == vec!["+debug/#", "+debug/#"]);

        dashboard.unsubscribe("debug/#").await.unwrap();
        assert!(dashboard.subscription_set().await.is_empty());
        dashboard.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribing_a_widget_topic_keeps_it_alive() {
        let transport = MockTransport::new();
        let store = WidgetStore::in_memory();
        store.add("Door", "home/door").await.unwrap();
        let dashboard = start(&transport, &store);

        dashboard.connect(config()).await.unwrap();
        wait_until!(!dashboard.subscription_set().await.is_empty());

        dashboard.unsubscribe("home/door").await.unwrap();
        assert_eq!(
            transport.subscription_calls(),
            vec!["+home/door", "-home/door", "+home/door"]
        );
        dashboard.shutdown().await;
    }

    #[tokio::test]
    async fn operations_fail_while_disconnected() {
        let transport = MockTransport::new();
        let store = WidgetStore::in_memory();
        let dashboard = start(&transport, &store);

        assert!(!dashboard.is_connected());
        assert_eq!(
            dashboard.publish("cmd", "on", QoS::AtMostOnce).await,
            Err(SessionError::NotConnected)
        );
        assert_eq!(
            dashboard.subscribe("cmd").await,
            Err(SessionError::NotConnected)
        );
        assert!(dashboard.subscription_set().await.is_empty());
        assert!(transport.calls().is_empty());
        dashboard.shutdown().await;
    }
}
