//! Live subscriber registry.
//!
//! Process-local map from channel name to connected sinks. Not persisted
//! and not authoritative: clients rebuild their subscriptions on
//! reconnect. Constructed at process start and injected into the
//! pipeline — never ambient shared state.

use chantier_core::ids::{ConnectionId, ProjectId, UserId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

struct Subscriber {
    id: ConnectionId,
    sender: UnboundedSender<serde_json::Value>,
}

/// Registry of live subscriber channels.
#[derive(Default)]
pub struct SubscriberRegistry {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel name carrying one user's notifications.
    #[must_use]
    pub fn user_channel(user_id: UserId) -> String {
        format!("user:{user_id}")
    }

    /// Channel name carrying one project's live updates.
    #[must_use]
    pub fn project_channel(project_id: ProjectId) -> String {
        format!("project:{project_id}")
    }

    /// Subscribe to a channel; the receiver yields every payload
    /// published to it until dropped or unsubscribed.
    pub fn subscribe(&self, channel: &str) -> (ConnectionId, UnboundedReceiver<serde_json::Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        self.lock()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        (id, receiver)
    }

    /// Drop one subscription.
    pub fn unsubscribe(&self, channel: &str, id: ConnectionId) {
        let mut channels = self.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Publish a payload to every live subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached; disconnected sinks are
    /// pruned on the way.
    pub fn publish(&self, channel: &str, payload: &serde_json::Value) -> usize {
        let mut channels = self.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|s| s.sender.send(payload.clone()).is_ok());
        let reached = subscribers.len();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        reached
    }

    /// Number of live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_reaches_live_subscribers() {
        let registry = SubscriberRegistry::new();
        let (_id, mut rx) = registry.subscribe("project:1");
        let reached = registry.publish("project:1", &json!({ "action": "lot_created" }));
        assert_eq!(reached, 1);
        let payload = rx.try_recv().expect("payload delivered");
        assert_eq!(payload["action"], "lot_created");
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let registry = SubscriberRegistry::new();
        let (_id, rx) = registry.subscribe("user:2");
        drop(rx);
        assert_eq!(registry.publish("user:2", &json!(1)), 0);
        assert_eq!(registry.subscriber_count("user:2"), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_connection() {
        let registry = SubscriberRegistry::new();
        let (id_a, _rx_a) = registry.subscribe("project:3");
        let (_id_b, _rx_b) = registry.subscribe("project:3");
        registry.unsubscribe("project:3", id_a);
        assert_eq!(registry.subscriber_count("project:3"), 1);
    }
}
