//! Timer table: id allocation, arming, cancellation and re-arming.
//!
//! The table itself never calls into the engine. The run loop drives a firing
//! in three steps: [`TimerTable::begin_firing`] marks the entry as running,
//! the loop invokes the callback if the entry is still alive, and
//! [`TimerTable::finish_firing`] decides between retiring and re-arming.

use crate::runtime::handles::HandlePair;
use crate::runtime::lock::lock_state;
use crate::runtime::queue::{DelayToken, LoopSender};
use crate::runtime::runner::RuntimeCommand;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Session-unique timer identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scheduled callback.
#[derive(Debug)]
pub struct TimerEntry {
    pub id: TimerId,
    pub pair: HandlePair,
    pub delay: Duration,
    pub recurring: bool,
    dead: AtomicBool,
}

impl TimerEntry {
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

/// What a cancellation did with the entry's handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The handles can go to the graveyard now.
    Bury(HandlePair),
    /// The entry is firing right now; the firing retires it when it returns.
    DeferredToFiring,
    /// No live timer with that id.
    Unknown,
}

/// What the run loop must do after a firing returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringOutcome {
    Retire(HandlePair),
    Rearmed,
}

struct TimerSlot {
    entry: Arc<TimerEntry>,
    armed: Option<DelayToken>,
}

struct TableState {
    next_id: u64,
    live: IndexMap<TimerId, TimerSlot>,
    running: Option<TimerId>,
}

pub(crate) struct TimerTable {
    state: Mutex<TableState>,
    sender: LoopSender<RuntimeCommand>,
}

impl TimerTable {
    pub(crate) fn new(sender: LoopSender<RuntimeCommand>) -> Self {
        Self {
            state: Mutex::new(TableState {
                next_id: 1,
                live: IndexMap::new(),
                running: None,
            }),
            sender,
        }
    }

    /// Allocate an id, store the entry and arm its first firing.
    ///
    /// Returns `None` when the run loop no longer accepts messages.
    pub(crate) fn schedule(
        &self,
        pair: HandlePair,
        delay: Duration,
        recurring: bool,
    ) -> Option<TimerId> {
        let mut state = lock_state(&self.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;

        let armed = self
            .sender
            .post_delayed(RuntimeCommand::FireTimer(id), delay)?;
        let entry = Arc::new(TimerEntry {
            id,
            pair,
            delay,
            recurring,
            dead: AtomicBool::new(false),
        });
        state.live.insert(
            id,
            TimerSlot {
                entry,
                armed: Some(armed),
            },
        );
        log::debug!("timer {id} scheduled in {delay:?} (recurring: {recurring})");
        Some(id)
    }

    /// Kill the entry, drop it from the live table and withdraw its pending
    /// firing if that is still possible.
    pub(crate) fn cancel(&self, id: TimerId) -> Cancellation {
        let mut state = lock_state(&self.state);
        let Some(slot) = state.live.shift_remove(&id) else {
            return Cancellation::Unknown;
        };

        slot.entry.mark_dead();
        if let Some(armed) = &slot.armed {
            armed.withdraw();
        }

        if state.running == Some(id) {
            Cancellation::DeferredToFiring
        } else {
            Cancellation::Bury(slot.entry.pair)
        }
    }

    /// Look up a live entry and mark it as the one currently firing.
    pub(crate) fn begin_firing(&self, id: TimerId) -> Option<Arc<TimerEntry>> {
        let mut state = lock_state(&self.state);
        let slot = state.live.get_mut(&id)?;
        slot.armed = None;
        let entry = slot.entry.clone();
        state.running = Some(id);
        Some(entry)
    }

    /// Close the firing started by [`begin_firing`](Self::begin_firing).
    pub(crate) fn finish_firing(&self, entry: &TimerEntry) -> FiringOutcome {
        let mut state = lock_state(&self.state);
        if state.running == Some(entry.id) {
            state.running = None;
        }

        // Cancelled while the callback ran: `cancel` already removed it.
        if entry.is_dead() {
            return FiringOutcome::Retire(entry.pair);
        }

        if !entry.recurring {
            state.live.shift_remove(&entry.id);
            return FiringOutcome::Retire(entry.pair);
        }

        let rearmed = self
            .sender
            .post_delayed(RuntimeCommand::FireTimer(entry.id), entry.delay);
        match (rearmed, state.live.get_mut(&entry.id)) {
            (Some(token), Some(slot)) => {
                slot.armed = Some(token);
                FiringOutcome::Rearmed
            }
            _ => {
                state.live.shift_remove(&entry.id);
                FiringOutcome::Retire(entry.pair)
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock_state(&self.state).live.len()
    }

    pub(crate) fn is_live(&self, id: TimerId) -> bool {
        lock_state(&self.state).live.contains_key(&id)
    }

    /// Kill every remaining entry and hand back their handles.
    pub(crate) fn clear(&self) -> Vec<HandlePair> {
        let mut state = lock_state(&self.state);
        let running = state.running;
        state
            .live
            .drain(..)
            .filter_map(|(id, slot)| {
                slot.entry.mark_dead();
                if let Some(armed) = &slot.armed {
                    armed.withdraw();
                }
                (running != Some(id)).then_some(slot.entry.pair)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::queue::{channel, LoopReceiver};
    use crate::runtime::testing::pair;

    fn table() -> (
        TimerTable,
        LoopReceiver<RuntimeCommand>,
        tokio::runtime::Runtime,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (tx, rx) = channel(rt.handle().clone());
        (TimerTable::new(tx), rx, rt)
    }

    fn next_fired(rx: &mut LoopReceiver<RuntimeCommand>, rt: &tokio::runtime::Runtime) -> TimerId {
        match rt.block_on(rx.recv()) {
            Some(RuntimeCommand::FireTimer(id)) => id,
            _ => panic!("expected a timer firing"),
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let (table, _rx, _rt) = table();
        let mut previous = None;
        for i in 0..20 {
            let id = table
                .schedule(pair(i), Duration::from_secs(60), false)
                .unwrap();
            if let Some(prev) = previous {
                assert!(id > prev);
            }
            if i % 2 == 0 {
                assert_eq!(table.cancel(id), Cancellation::Bury(pair(i)));
            }
            previous = Some(id);
        }
        let fresh = table.schedule(pair(99), Duration::ZERO, false).unwrap();
        assert_eq!(fresh.raw(), 21);
    }

    #[test]
    fn test_cancel_unknown_id() {
        let (table, _rx, _rt) = table();
        let id = table.schedule(pair(1), Duration::from_secs(1), false).unwrap();
        assert!(matches!(table.cancel(id), Cancellation::Bury(_)));
        assert_eq!(table.cancel(id), Cancellation::Unknown);
        assert!(!table.is_live(id));
    }

    #[test]
    fn test_firing_after_cancel_finds_nothing() {
        let (table, mut rx, rt) = table();
        let id = table.schedule(pair(1), Duration::ZERO, false).unwrap();
        // Let the zero-delay message reach the queue before cancelling.
        let fired = next_fired(&mut rx, &rt);
        assert_eq!(fired, id);

        assert_eq!(table.cancel(id), Cancellation::Bury(pair(1)));
        assert!(table.begin_firing(fired).is_none());
    }

    #[test]
    fn test_one_shot_retires_after_firing() {
        let (table, mut rx, rt) = table();
        let id = table.schedule(pair(2), Duration::ZERO, false).unwrap();
        let entry = table.begin_firing(next_fired(&mut rx, &rt)).unwrap();
        assert!(!entry.is_dead());
        assert_eq!(table.finish_firing(&entry), FiringOutcome::Retire(pair(2)));
        assert!(!table.is_live(id));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_recurring_rearms_with_same_delay() {
        let (table, mut rx, rt) = table();
        let id = table
            .schedule(pair(3), Duration::from_millis(5), true)
            .unwrap();

        for _ in 0..3 {
            let entry = table.begin_firing(next_fired(&mut rx, &rt)).unwrap();
            assert_eq!(entry.id, id);
            assert_eq!(table.finish_firing(&entry), FiringOutcome::Rearmed);
            assert!(table.is_live(id));
        }
    }

    #[test]
    fn test_cancel_during_own_firing_defers_disposal() {
        let (table, mut rx, rt) = table();
        let id = table.schedule(pair(4), Duration::ZERO, true).unwrap();
        let entry = table.begin_firing(next_fired(&mut rx, &rt)).unwrap();

        // The callback cancels its own timer.
        assert_eq!(table.cancel(id), Cancellation::DeferredToFiring);
        assert!(entry.is_dead());

        assert_eq!(table.finish_firing(&entry), FiringOutcome::Retire(pair(4)));
        assert!(!table.is_live(id));
    }

    #[test]
    fn test_clear_skips_running_entry() {
        let (table, mut rx, rt) = table();
        let running = table.schedule(pair(5), Duration::ZERO, true).unwrap();
        table.schedule(pair(6), Duration::from_secs(60), false).unwrap();
        let entry = table.begin_firing(next_fired(&mut rx, &rt)).unwrap();
        assert_eq!(entry.id, running);

        assert_eq!(table.clear(), vec![pair(6)]);
        assert!(entry.is_dead());
        assert_eq!(table.finish_firing(&entry), FiringOutcome::Retire(pair(5)));
    }
}
