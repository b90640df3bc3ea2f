//! Listener fan-out.
//!
//! A plain observer list: it hands values to subscribers and knows nothing
//! about watch state or eviction, which the entry tracks separately.

use std::sync::Arc;

use serde_json::Value;

/// Receives the entry's value on every change; `None` means the entry was reset.
pub type Listener = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct Notifier {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl Notifier {
    pub(crate) fn subscribe(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns whether `id` was subscribed.
    pub(crate) fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Copy of the current listeners, so they can be called without holding
    /// the entry lock.
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Listener> {
        self.listeners
            .drain(..)
            .map(|(_, listener)| listener)
            .collect()
    }

    pub(crate) fn contains(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|(existing, _)| *existing == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

pub(crate) fn notify_all(listeners: &[Listener], value: Option<&Value>) {
    for listener in listeners {
        listener(value);
    }
}
