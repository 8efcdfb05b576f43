//! The interpreter execution lock and small locking helpers.

use crate::runtime::engine::ScriptEngine;
use crate::runtime::error::{Result, RuntimeError};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Lock a short-lived state mutex, recovering the data if a holder panicked.
///
/// The tables guarded this way are only mutated in small critical sections
/// that leave them consistent at every step.
pub(crate) fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f`, turning a panic into a logged `None`.
pub(crate) fn contain<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("{what} panicked: {reason}");
            None
        }
    }
}

/// Exclusive right to call into the script engine.
///
/// Every engine entry point runs under this lock, whichever thread it comes
/// from. The lock is not reentrant: a thread that already holds it gets
/// [`RuntimeError::ReentrantLock`] instead of deadlocking on itself.
pub struct ExecutionLock {
    engine: Mutex<Box<dyn ScriptEngine>>,
    holder: Mutex<Option<ThreadId>>,
}

impl ExecutionLock {
    pub fn new(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine: Mutex::new(engine),
            holder: Mutex::new(None),
        }
    }

    /// Block until the engine is free and take it.
    pub fn acquire(&self) -> Result<EngineGuard<'_>> {
        let current = thread::current().id();
        if *lock_state(&self.holder) == Some(current) {
            return Err(RuntimeError::ReentrantLock);
        }

        let inner = self.engine.lock().unwrap_or_else(|poisoned| {
            log::warn!("engine lock was poisoned by a panicking holder; continuing");
            poisoned.into_inner()
        });
        *lock_state(&self.holder) = Some(current);

        Ok(EngineGuard { inner, lock: self })
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *lock_state(&self.holder) == Some(thread::current().id())
    }
}

/// Held access to the engine; releases the execution lock on drop.
pub struct EngineGuard<'a> {
    inner: MutexGuard<'a, Box<dyn ScriptEngine>>,
    lock: &'a ExecutionLock,
}

impl Deref for EngineGuard<'_> {
    type Target = dyn ScriptEngine;

    fn deref(&self) -> &Self::Target {
        &**self.inner
    }
}

impl DerefMut for EngineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.inner
    }
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        *lock_state(&self.lock.holder) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::RecordingEngine;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn lock() -> Arc<ExecutionLock> {
        let (engine, _log) = RecordingEngine::new();
        Arc::new(ExecutionLock::new(Box::new(engine)))
    }

    #[test]
    fn test_reacquire_on_same_thread_is_refused() {
        let lock = lock();
        let guard = lock.acquire().unwrap();
        assert!(lock.is_held_by_current_thread());
        assert!(matches!(lock.acquire(), Err(RuntimeError::ReentrantLock)));
        drop(guard);
        assert!(!lock.is_held_by_current_thread());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_other_thread_waits_for_release() {
        let lock = lock();
        let guard = lock.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.acquire().unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        other.join().unwrap();
    }

    #[test]
    fn test_contain_swallows_panics() {
        assert_eq!(contain("ok", || 5), Some(5));
        assert_eq!(contain("boom", || -> u8 { panic!("boom") }), None);
    }

    #[test]
    fn test_lock_state_recovers_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock_state(&mutex) += 1;
        assert_eq!(*lock_state(&mutex), 2);
    }
}
