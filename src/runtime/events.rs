//! Named host events that scripts subscribe to.

use crate::runtime::handles::HandlePair;
use crate::runtime::lock::lock_state;
use indexmap::IndexMap;
use std::sync::Mutex;

/// Listener lists keyed by event name, in registration order.
#[derive(Debug, Default)]
pub struct EventRegistry {
    listeners: Mutex<IndexMap<String, Vec<HandlePair>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, pair: HandlePair) {
        let event = event.into();
        log::debug!("listener {pair} added for '{event}'");
        lock_state(&self.listeners)
            .entry(event)
            .or_default()
            .push(pair);
    }

    /// Snapshot of the listeners for `event`.
    pub fn listeners(&self, event: &str) -> Vec<HandlePair> {
        lock_state(&self.listeners)
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every listener of `event` and return them for disposal.
    pub fn off(&self, event: &str) -> Vec<HandlePair> {
        lock_state(&self.listeners)
            .shift_remove(event)
            .unwrap_or_default()
    }

    /// Remove everything; used at shutdown.
    pub fn clear(&self) -> Vec<HandlePair> {
        lock_state(&self.listeners)
            .drain(..)
            .flat_map(|(_, pairs)| pairs)
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        lock_state(&self.listeners).values().map(Vec::len).sum()
    }
}
