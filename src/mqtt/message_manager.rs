//! Inbound message routing
//!
//! The session dispatcher hands every inbound `(topic, payload)` to
//! [`MessageRouter::route`], one event at a time. The router decodes the payload,
//! matches the topic against the current [`SubscriptionSet`] and records the
//! result in the latest-message map. Widgets whose filters match are notified
//! through a broadcast channel.
//!
//! Both maps sit behind a single lock so a route never interleaves with a
//! subscription update coming from the reconciliation loop.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use super::registry::SubscriptionSet;
use super::topic;
use crate::persistence::WidgetId;

const PREVIEW_CHARS: usize = 10;

/// A received message with its decoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            content: content.into(),
            timestamp: Local::now(),
        }
    }

    /// Decodes the payload as UTF-8, replacing invalid sequences
    pub fn from_payload(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload).into_owned())
    }

    pub fn preview(&self) -> String {
        let mut preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        if self.content.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        preview
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.topic,
            self.content
        )
    }
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.timestamp.format("%H:%M:%S"),
            self.preview()
        )
    }
}

/// Notification for one widget whose filter matched an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetMessage {
    pub widget: WidgetId,
    pub message: MqttMessage,
}

/// Result of routing one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No registered filter matched the topic
    Dropped,
    /// The latest-message map was updated and `widgets` widgets were notified
    Delivered { widgets: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct RouterState {
    subscriptions: SubscriptionSet,
    latest: HashMap<String, MqttMessage>,
    by_widget: HashMap<WidgetId, MqttMessage>,
    stats: RouterStats,
}

pub struct MessageRouter {
    state: RwLock<RouterState>,
    updates: broadcast::Sender<WidgetMessage>,
}

impl MessageRouter {
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            state: RwLock::new(RouterState::default()),
            updates,
        }
    }

    /// Replaces the filters messages are matched against
    ///
    /// Per-widget latest values of widgets that no longer appear are dropped.
    pub async fn set_subscriptions(&self, subscriptions: SubscriptionSet) {
        let mut state = self.state.write().await;
        let live: BTreeSet<WidgetId> = subscriptions.values().flatten().copied().collect();
        state.by_widget.retain(|widget, _| live.contains(widget));
        debug!("Router now matches {} topic filters", subscriptions.len());
        state.subscriptions = subscriptions;
    }

    pub async fn subscriptions(&self) -> SubscriptionSet {
        self.state.read().await.subscriptions.clone()
    }

    /// Routes one inbound message
    pub async fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let mut state = self.state.write().await;

        let mut matched = false;
        let mut widgets = BTreeSet::new();
        for (filter, ids) in &state.subscriptions {
            if topic::matches(filter, topic) {
                matched = true;
                widgets.extend(ids.iter().copied());
            }
        }

        if !matched {
            trace!("No subscription matches {}, dropping message", topic);
            state.stats.dropped += 1;
            return RouteOutcome::Dropped;
        }

        let message = MqttMessage::from_payload(topic, payload);
        state.latest.insert(topic.to_string(), message.clone());
        state.stats.delivered += 1;

        for widget in &widgets {
            state.by_widget.insert(*widget, message.clone());
            // No receivers is fine, the maps still hold the value
            let _ = self.updates.send(WidgetMessage {
                widget: *widget,
                message: message.clone(),
            });
        }

        debug!("Routed {} to {} widgets", topic, widgets.len());
        RouteOutcome::Delivered {
            widgets: widgets.len(),
        }
    }

    /// Snapshot of the latest payload per concrete topic
    pub async fn latest_messages(&self) -> HashMap<String, MqttMessage> {
        self.state.read().await.latest.clone()
    }

    pub async fn latest(&self, topic: &str) -> Option<MqttMessage> {
        self.state.read().await.latest.get(topic).cloned()
    }

    pub async fn latest_for_widget(&self, widget: WidgetId) -> Option<MqttMessage> {
        self.state.read().await.by_widget.get(&widget).cloned()
    }

    pub async fn stats(&self) -> RouterStats {
        self.state.read().await.stats
    }

    pub fn updates(&self) -> broadcast::Receiver<WidgetMessage> {
        self.updates.subscribe()
    }
}
