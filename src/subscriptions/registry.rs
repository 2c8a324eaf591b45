//! Channel → subscriber registry.

use super::types::{Callback, Subscriber, SubscriptionId};
use std::collections::HashMap;

/// Subscribers per channel, in registration order.
///
/// Not synchronized; the emitter guards it with its state lock and
/// dispatches from [`SubscriberRegistry::snapshot`] copies.
pub struct SubscriberRegistry<T> {
    channels: HashMap<String, Vec<Subscriber<T>>>,
    /// Counter for generating subscription IDs.
    next_id: u64,
}

impl<T> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(
        &mut self,
        channel: &str,
        id: SubscriptionId,
        callback: Callback<T>,
    ) -> Subscriber<T> {
        let subscriber = Subscriber { id, callback };
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(subscriber.clone());
        subscriber
    }

    /// Remove one subscriber. Returns false if it was not registered.
    pub fn remove(&mut self, channel: &str, id: SubscriptionId) -> bool {
        let Some(subs) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Remove every subscriber of `channel`. Returns how many were removed.
    pub fn remove_channel(&mut self, channel: &str) -> usize {
        self.channels.remove(channel).map_or(0, |subs| subs.len())
    }

    pub fn contains(&self, channel: &str, id: SubscriptionId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|subs| subs.iter().any(|s| s.id == id))
    }

    /// Copy of the current subscribers of `channel`.
    pub fn snapshot(&self, channel: &str) -> Vec<Subscriber<T>> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
