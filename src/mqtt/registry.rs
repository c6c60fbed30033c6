//! Topic registry: which widget wants which topic filter
//!
//! Several widgets may share one filter, so each filter keeps the set of widget
//! ids interested in it. A filter is dropped once its last widget is released.

use std::collections::{BTreeMap, BTreeSet};

use crate::persistence::{Widget, WidgetId};

/// Topic filter to the widget ids interested in it
pub type SubscriptionSet = BTreeMap<String, BTreeSet<WidgetId>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicRegistry {
    topics: SubscriptionSet,
    owners: BTreeMap<WidgetId, String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry for a complete widget list
    pub fn from_widgets(widgets: &[Widget]) -> Self {
        let mut registry = Self::new();
        for widget in widgets {
            registry.register(widget.id, &widget.topic);
        }
        registry
    }

    /// Registers `widget` for `topic`, moving it off any previous topic
    pub fn register(&mut self, widget: WidgetId, topic: &str) {
        if self.owners.get(&widget).map(String::as_str) == Some(topic) {
            return;
        }
        self.release(widget);
        self.owners.insert(widget, topic.to_string());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(widget);
    }

    /// Removes `widget`; returns the topic it held if no other widget wants it
    pub fn release(&mut self, widget: WidgetId) -> Option<String> {
        let topic = self.owners.remove(&widget)?;
        let now_unused = match self.topics.get_mut(&topic) {
            Some(ids) => {
                ids.remove(&widget);
                ids.is_empty()
            }
            None => false,
        };
        if now_unused {
            self.topics.remove(&topic);
            Some(topic)
        } else {
            None
        }
    }

    pub fn ref_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, BTreeSet::len)
    }

    pub fn interested(&self, topic: &str) -> Option<&BTreeSet<WidgetId>> {
        self.topics.get(topic)
    }

    pub fn topic_of(&self, widget: WidgetId) -> Option<&str> {
        self.owners.get(&widget).map(String::as_str)
    }

    /// Distinct topic filters currently registered
    pub fn topics(&self) -> BTreeSet<String> {
        self.topics.keys().cloned().collect()
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
