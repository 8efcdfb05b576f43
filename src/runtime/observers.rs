//! Readiness observers.
//!
//! Observers registered before the engine is ready are called once by the
//! readiness broadcast; observers registered afterwards are called right away
//! on the registering thread.

use crate::runtime::lock::{contain, lock_state};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub trait ReadyObserver: Send + Sync {
    fn on_ready(&self);
}

impl<F> ReadyObserver for F
where
    F: Fn() + Send + Sync,
{
    fn on_ready(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ObserverState {
    ready: bool,
    waiting: IndexMap<ObserverId, Arc<dyn ReadyObserver>>,
}

#[derive(Default)]
pub(crate) struct ReadyObservers {
    state: Mutex<ObserverState>,
    next_id: AtomicU64,
}

impl ReadyObservers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, observer: Arc<dyn ReadyObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = lock_state(&self.state);
        if state.ready {
            drop(state);
            contain("ready observer", || observer.on_ready());
        } else {
            state.waiting.insert(id, observer);
        }
        id
    }

    /// Returns false if the observer already fired or was never registered.
    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        lock_state(&self.state).waiting.shift_remove(&id).is_some()
    }

    pub(crate) fn is_ready(&self) -> bool {
        lock_state(&self.state).ready
    }

    /// Flip to ready and notify everyone waiting. Only the first call does
    /// anything.
    pub(crate) fn broadcast(&self) -> usize {
        let waiting = {
            let mut state = lock_state(&self.state);
            if state.ready {
                return 0;
            }
            state.ready = true;
            std::mem::take(&mut state.waiting)
        };

        let notified = waiting.len();
        for observer in waiting.into_values() {
            contain("ready observer", || observer.on_ready());
        }
        notified
    }
}
