//! Opaque callback handles and the registry that owns their lifetime.
//!
//! Handles are minted by the script engine and only ever travel through the
//! runtime as tokens. The runtime never looks inside them; it forwards them to
//! [`ScriptEngine::invoke`] and eventually hands them back through
//! [`ScriptEngine::dispose`]. [`HandleRegistry`] is the single gate for both.
//!
//! [`ScriptEngine::invoke`]: crate::runtime::engine::ScriptEngine::invoke
//! [`ScriptEngine::dispose`]: crate::runtime::engine::ScriptEngine::dispose

use crate::runtime::engine::ScriptEngine;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::lock::lock_state;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Engine-owned reference to a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Engine-owned reference to the `this` value a callback is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverHandle(u64);

impl ReceiverHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A callback together with its receiver; the unit of invocation and disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlePair {
    pub callback: CallbackHandle,
    pub receiver: ReceiverHandle,
}

impl HandlePair {
    pub const fn new(callback: CallbackHandle, receiver: ReceiverHandle) -> Self {
        Self { callback, receiver }
    }
}

impl fmt::Display for HandlePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}/this#{}", self.callback.0, self.receiver.0)
    }
}

/// Tracks which handle pairs are still live.
///
/// A pair is adopted when the runtime takes ownership of it (timer
/// registration, async request, event listener) and retired exactly once.
/// Invoking or retiring a pair that is not live is refused, so a stale token
/// can never reach the engine twice.
///
/// One live pair backs exactly one registration. Adopting a pair that is
/// already live is refused; the engine mints a fresh pair per registration
/// and may reuse one only after it has been disposed.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: Mutex<HashSet<HandlePair>>,
    disposal_failures: AtomicUsize,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `pair`. Returns false, adopting nothing, if it is
    /// already live.
    pub fn adopt(&self, pair: HandlePair) -> bool {
        self.adopt_all(&[pair])
    }

    /// Take ownership of every pair or of none. Fails if any pair is already
    /// live or appears twice in `pairs`.
    pub fn adopt_all(&self, pairs: &[HandlePair]) -> bool {
        let mut live = lock_state(&self.live);
        let distinct = pairs
            .iter()
            .enumerate()
            .all(|(i, pair)| !pairs[..i].contains(pair));
        if let Some(taken) = pairs.iter().find(|pair| live.contains(pair)) {
            log::warn!("handle {taken} is already registered");
            return false;
        }
        if !distinct {
            log::warn!("the same handle was passed twice for one registration");
            return false;
        }
        live.extend(pairs.iter().copied());
        true
    }

    pub fn is_live(&self, pair: HandlePair) -> bool {
        lock_state(&self.live).contains(&pair)
    }

    pub fn len(&self) -> usize {
        lock_state(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `dispose` calls the engine has rejected so far.
    pub fn disposal_failures(&self) -> usize {
        self.disposal_failures.load(Ordering::Relaxed)
    }

    /// Call into the engine with a live pair.
    ///
    /// Must run while the execution lock is held; the registry lock itself is
    /// released before the engine is entered.
    pub fn invoke(
        &self,
        engine: &mut dyn ScriptEngine,
        pair: HandlePair,
        args: &[serde_json::Value],
    ) -> Result<()> {
        if !self.is_live(pair) {
            return Err(RuntimeError::RetiredHandle(pair));
        }
        engine.invoke(pair, args)?;
        Ok(())
    }

    /// Drop the pair from the live set and ask the engine to release it.
    ///
    /// The pair counts as retired even when the engine reports a failure.
    pub fn retire(&self, engine: &mut dyn ScriptEngine, pair: HandlePair) -> Result<()> {
        if !lock_state(&self.live).remove(&pair) {
            return Err(RuntimeError::RetiredHandle(pair));
        }
        engine.dispose(pair).map_err(|err| {
            self.disposal_failures.fetch_add(1, Ordering::Relaxed);
            RuntimeError::from(err)
        })
    }
}
