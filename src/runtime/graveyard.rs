//! Deferred disposal of handle pairs.
//!
//! Any thread may bury a pair. Only the owning thread sweeps, with the
//! execution lock held, so disposal never races an invocation of the same
//! handle.

use crate::runtime::engine::ScriptEngine;
use crate::runtime::handles::{HandlePair, HandleRegistry};
use crate::runtime::lock::{contain, lock_state};
use indexmap::IndexSet;
use std::sync::Mutex;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub disposed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct Graveyard {
    pending: Mutex<IndexSet<HandlePair>>,
}

impl Graveyard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `pair` for disposal. Returns false if it was already queued.
    pub fn bury(&self, pair: HandlePair) -> bool {
        lock_state(&self.pending).insert(pair)
    }

    pub fn len(&self) -> usize {
        lock_state(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pair: HandlePair) -> bool {
        lock_state(&self.pending).contains(&pair)
    }

    /// Atomically take everything queued so far.
    fn take(&self) -> IndexSet<HandlePair> {
        std::mem::take(&mut *lock_state(&self.pending))
    }

    /// Dispose every queued pair. A failing pair is logged and skipped.
    pub fn sweep(&self, registry: &HandleRegistry, engine: &mut dyn ScriptEngine) -> SweepReport {
        let batch = self.take();
        let mut report = SweepReport::default();

        for pair in batch {
            match contain("handle disposal", || registry.retire(engine, pair)) {
                Some(Ok(())) => report.disposed += 1,
                Some(Err(err)) => {
                    log::warn!("could not dispose {pair}: {err}");
                    report.failed += 1;
                }
                None => report.failed += 1,
            }
        }

        if report.disposed + report.failed > 0 {
            log::debug!(
                "graveyard sweep disposed {} handle pairs ({} failed)",
                report.disposed,
                report.failed
            );
        }
        report
    }
}
