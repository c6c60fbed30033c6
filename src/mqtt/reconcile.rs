//! # Subscription Reconciliation
//!
//! Keeps the broker subscriptions in line with the widget list. Each pass computes
//!
//! ```text
//! desired = distinct widget topics ∪ pinned topics
//! current = topics with an issued subscribe on this connection
//! ```
//!
//! and issues `subscribe` for `desired - current`, then `unsubscribe` for
//! `current - desired`. Subscribing first keeps a topic moving between widgets
//! from going dark in between.
//!
//! While the session is not Connected a pass only records the desired set. The
//! next transition into Connected starts a new connection epoch, which empties
//! `current` and replays the full desired set.
//!
//! Bookkeeping is optimistic: `current` changes when a call is issued, not when
//! the broker acknowledges it. Failed calls are logged and reported as error
//! events without rolling anything back.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::QoS;
use super::error::{ErrorKind, SessionError};
use super::message_manager::MessageRouter;
use super::registry::{SubscriptionSet, TopicRegistry};
use super::session::{SessionManager, SessionState, StateChange};
use crate::persistence::Widget;

/// Calls issued by one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

impl ReconcilePlan {
    pub fn between(desired: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            subscribe: desired.difference(current).cloned().collect(),
            unsubscribe: current.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

pub struct Reconciler {
    session: Arc<SessionManager>,
    router: Arc<MessageRouter>,
    registry: TopicRegistry,
    pinned: BTreeSet<String>,
    current: BTreeSet<String>,
    epoch: u64,
    qos: QoS,
}

impl Reconciler {
    pub fn new(session: Arc<SessionManager>, router: Arc<MessageRouter>, qos: QoS) -> Self {
        Self {
            session,
            router,
            registry: TopicRegistry::new(),
            pinned: BTreeSet::new(),
            current: BTreeSet::new(),
            epoch: 0,
            qos,
        }
    }

    pub fn desired(&self) -> BTreeSet<String> {
        let mut desired = self.registry.topics();
        desired.extend(self.pinned.iter().cloned());
        desired
    }

    pub fn current(&self) -> &BTreeSet<String> {
        &self.current
    }

    /// Filters with an issued subscribe and the widgets behind each
    ///
    /// Pinned filters appear with an empty widget set.
    pub fn subscription_set(&self) -> SubscriptionSet {
        self.current
            .iter()
            .map(|topic| {
                let widgets = self.registry.interested(topic).cloned().unwrap_or_default();
                (topic.clone(), widgets)
            })
            .collect()
    }

    pub async fn widgets_changed(&mut self, widgets: &[Widget]) -> ReconcilePlan {
        debug!("Widget list changed, {} widgets", widgets.len());
        self.registry = TopicRegistry::from_widgets(widgets);
        self.reconcile().await
    }

    pub async fn state_changed(&mut self, state: SessionState) -> ReconcilePlan {
        debug!("Session state changed to {}", state);
        self.reconcile().await
    }

    /// Records a filter the caller already subscribed to directly
    pub async fn pin(&mut self, topic: &str) {
        self.pinned.insert(topic.to_string());
        if self.session.is_connected() {
            self.sync_epoch();
            self.current.insert(topic.to_string());
        }
        self.sync_router().await;
    }

    /// Forgets a pinned filter the caller already unsubscribed from
    ///
    /// A widget that still wants the filter gets it re-subscribed.
    pub async fn unpin(&mut self, topic: &str) -> ReconcilePlan {
        self.pinned.remove(topic);
        self.current.remove(topic);
        self.reconcile().await
    }

    pub async fn reconcile(&mut self) -> ReconcilePlan {
        if !self.session.is_connected() {
            if !self.current.is_empty() {
                debug!("Session not connected, forgetting {} subscriptions", self.current.len());
                self.current.clear();
            }
            debug!(
                "Deferring reconciliation of {} topics until connected",
                self.desired().len()
            );
            self.sync_router().await;
            return ReconcilePlan::default();
        }

        self.sync_epoch();
        let plan = ReconcilePlan::between(&self.desired(), &self.current);
        if plan.is_empty() {
            self.sync_router().await;
            return plan;
        }

        info!(
            "Reconciling subscriptions: +{:?} -{:?}",
            plan.subscribe, plan.unsubscribe
        );

        for topic in &plan.subscribe {
            self.current.insert(topic.clone());
            let result = self.session.subscribe(topic, self.qos).await;
            if !self.handle_failure(result, "Subscribe to", topic) {
                return plan;
            }
        }
        for topic in &plan.unsubscribe {
            self.current.remove(topic);
            let result = self.session.unsubscribe(topic).await;
            if !self.handle_failure(result, "Unsubscribe from", topic) {
                return plan;
            }
        }

        self.sync_router().await;
        plan
    }

    /// Reports a failed call; false if the session is gone and the pass must stop
    ///
    /// Losing the connection mid-pass is not a subscription failure. The state
    /// change that follows triggers the next pass.
    fn handle_failure(&mut self, result: Result<(), SessionError>, action: &str, topic: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(SessionError::NotConnected) => {
                debug!("Session dropped during reconciliation at {} {}", action, topic);
                self.current.clear();
                false
            }
            Err(e) => {
                warn!("{} {} failed during reconciliation: {}", action, topic, e);
                self.session
                    .report(ErrorKind::Subscription, format!("{} {} failed: {}", action, topic, e));
                true
            }
        }
    }

    /// Drops `current` when the broker connection was re-established
    fn sync_epoch(&mut self) {
        let epoch = self.session.connection_epoch();
        if epoch != self.epoch {
            debug!("New connection epoch {}, replaying all subscriptions", epoch);
            self.current.clear();
            self.epoch = epoch;
        }
    }

    async fn sync_router(&self) {
        self.router.set_subscriptions(self.subscription_set()).await;
    }
}

/// Drives a shared [`Reconciler`] from widget-list and session-state changes
///
/// Reconciles once with the current widget list on start. Stops when `shutdown`
/// fires or either source closes.
pub fn spawn_reconciliation(
    reconciler: Arc<Mutex<Reconciler>>,
    mut widgets: watch::Receiver<Vec<Widget>>,
    mut changes: broadcast::Receiver<StateChange>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = widgets.borrow_and_update().clone();
        reconciler.lock().await.widgets_changed(&initial).await;
        info!("Reconciliation loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = widgets.changed() => {
                    if changed.is_err() {
                        info!("Widget source closed");
                        break;
                    }
                    let list = widgets.borrow_and_update().clone();
                    reconciler.lock().await.widgets_changed(&list).await;
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        reconciler.lock().await.state_changed(change.state).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} session state changes, resynchronising", missed);
                        reconciler.lock().await.reconcile().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Reconciliation loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{ConnectionConfig, Protocol};
    use crate::mqtt::session::SessionSettings;
    use crate::mqtt::testing::{wait_until, MockTransport};
    use proptest::prelude::*;

    fn widget(id: u64, topic: &str) -> Widget {
        Widget::new(id, format!("w{}", id), topic)
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(Protocol::Plain, "broker.local", 1883)
    }

    fn reconciler(transport: &MockTransport) -> Reconciler {
        let router = Arc::new(MessageRouter::new(16));
        let session = SessionManager::spawn(
            Arc::new(transport.clone()),
            router.clone(),
            SessionSettings::default(),
        );
        Reconciler::new(session, router, QoS::AtMostOnce)
    }

    #[test]
    fn plan_subscribes_missing_and_drops_stale() {
        let desired = BTreeSet::from(["a".to_string(), "b".to_string()]);
        let current = BTreeSet::from(["b".to_string(), "c".to_string()]);
        let plan = ReconcilePlan::between(&desired, &current);
        assert_eq!(plan.subscribe, vec!["a".to_string()]);
        assert_eq!(plan.unsubscribe, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn connect_replays_widget_topics_then_delete_unsubscribes() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        let mut reconciler = reconciler(&transport);

        let plan = reconciler
            .widgets_changed(&[widget(1, "a"), widget(2, "b")])
            .await;
        assert!(plan.is_empty());
        assert!(reconciler.subscription_set().is_empty());

        reconciler.session.connect(config()).await.unwrap();
        reconciler.state_changed(SessionState::Connected).await;
        assert_eq!(transport.subscription_calls(), vec!["+a", "+b"]);

        transport.clear_calls();
        reconciler.widgets_changed(&[widget(2, "b")]).await;
        assert_eq!(transport.subscription_calls(), vec!["-a"]);
        assert_eq!(
            reconciler.subscription_set().keys().cloned().collect::<Vec<_>>(),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn shared_topic_stays_subscribed_until_last_widget_leaves() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        let mut reconciler = reconciler(&transport);
        reconciler.session.connect(config()).await.unwrap();

        reconciler
            .widgets_changed(&[widget(1, "a"), widget(2, "a")])
            .await;
        reconciler.widgets_changed(&[widget(2, "a")]).await;
        assert_eq!(transport.subscription_calls(), vec!["+a"]);

        reconciler.widgets_changed(&[]).await;
        assert_eq!(transport.subscription_calls(), vec!["+a", "-a"]);
        assert!(reconciler.subscription_set().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replays_everything() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        let mut reconciler = reconciler(&transport);
        reconciler.session.connect(config()).await.unwrap();
        reconciler.widgets_changed(&[widget(1, "a")]).await;

        reconciler.session.disconnect().await.unwrap();
        reconciler.state_changed(SessionState::Disconnected).await;
        assert!(reconciler.current().is_empty());

        reconciler.session.connect(config()).await.unwrap();
        reconciler.state_changed(SessionState::Connected).await;
        assert_eq!(transport.subscription_calls(), vec!["+a", "+a"]);
    }

    #[tokio::test]
    async fn failed_subscribe_is_reported_but_kept() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        transport.fail_subscribe("broken");
        let mut reconciler = reconciler(&transport);
        let mut errors = reconciler.session.errors();
        reconciler.session.connect(config()).await.unwrap();

        reconciler
            .widgets_changed(&[widget(1, "broken"), widget(2, "ok")])
            .await;
        assert_eq!(reconciler.current().len(), 2);
        assert_eq!(errors.recv().await.unwrap().kind, ErrorKind::Subscription);
    }

    #[tokio::test]
    async fn connection_lost_mid_pass_is_not_a_subscription_error() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        transport.drop_connection_on_subscribe("a");
        let mut reconciler = reconciler(&transport);
        let mut errors = reconciler.session.errors();
        reconciler
            .session
            .connect(config().with_auto_reconnect(false))
            .await
            .unwrap();

        reconciler
            .widgets_changed(&[widget(1, "a"), widget(2, "b")])
            .await;
        assert_eq!(transport.subscription_calls(), vec!["+a"]);
        assert!(reconciler.current().is_empty());
        assert_eq!(reconciler.session.state(), SessionState::Disconnected);

        let event = errors.recv().await.unwrap();
        assert_eq!(event.kind, ErrorKind::Transport);
        assert_eq!(event.message, "network down");
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn pinned_topics_survive_widget_changes() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        let mut reconciler = reconciler(&transport);
        reconciler.session.connect(config()).await.unwrap();

        reconciler.pin("debug/#").await;
        reconciler.widgets_changed(&[widget(1, "a")]).await;
        reconciler.widgets_changed(&[]).await;
        assert_eq!(transport.subscription_calls(), vec!["+a", "-a"]);
        assert!(reconciler.subscription_set().contains_key("debug/#"));

        let plan = reconciler.unpin("debug/#").await;
        assert!(plan.is_empty());
        assert!(reconciler.subscription_set().is_empty());
    }

    #[tokio::test]
    async fn background_loop_follows_widgets_and_state() {
        let transport = MockTransport::new();
        transport.set_auto_connect(true);
        let reconciler = reconciler(&transport);
        let session = reconciler.session.clone();
        let router = reconciler.router.clone();
        let reconciler = Arc::new(Mutex::new(reconciler));

        let (widgets_tx, widgets_rx) = watch::channel(vec![widget(1, "sensor/#")]);
        let shutdown = CancellationToken::new();
        let task = spawn_reconciliation(
            reconciler.clone(),
            widgets_rx,
            session.state_changes(),
            shutdown.clone(),
        );

        session.connect(config()).await.unwrap();
        wait_until!(router.subscriptions().await.contains_key("sensor/#"));

        widgets_tx.send_replace(vec![widget(1, "sensor/#"), widget(2, "cmd")]);
        wait_until!(router.subscriptions().await.len() == 2);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(transport.subscription_calls(), vec!["+sensor/#", "+cmd"]);
    }

    proptest! {
        #[test]
        fn subscription_set_matches_widget_topics(
            first in prop::collection::vec("[a-c]{1,2}(/[a-c]{1,2})?", 0..6),
            second in prop::collection::vec("[a-c]{1,2}(/[a-c]{1,2})?", 0..6),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let transport = MockTransport::new();
                transport.set_auto_connect(true);
                let mut reconciler = reconciler(&transport);
                reconciler.session.connect(config()).await.unwrap();

                for topics in [&first, &second] {
                    let widgets: Vec<Widget> = topics
                        .iter()
                        .enumerate()
                        .map(|(id, topic)| widget(id as u64, topic))
                        .collect();
                    reconciler.widgets_changed(&widgets).await;

                    let expected: BTreeSet<String> = topics.iter().cloned().collect();
                    let actual: BTreeSet<String> =
                        reconciler.subscription_set().keys().cloned().collect();
                    assert_eq!(actual, expected);
                }
            });
        }
    }
}
