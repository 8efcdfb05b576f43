//! Jobs that run as soon as the interpreter yields control.
//!
//! Enqueueing onto an empty, idle queue reports that a drain has to be
//! started; the caller decides where it runs (see [`TickOrigin`]). A drain
//! keeps taking batches under the execution lock until it sees an empty
//! queue, so jobs queued by a running batch join the same drain session.

use crate::runtime::engine::ScriptEngine;
use crate::runtime::error::Result;
use crate::runtime::lock::{contain, lock_state, ExecutionLock};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A unit of work that runs with exclusive access to the engine.
pub type TickJob = Box<dyn FnOnce(&mut dyn ScriptEngine) + Send + 'static>;

/// Where an enqueue comes from, which decides how a drain gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOrigin {
    /// Code already running on the owning thread. The drain goes to a
    /// short-lived helper thread that waits for the execution lock.
    OwningThread,
    /// Any other thread. The drain is posted to the urgent lane of the run
    /// loop, ahead of ordinary messages.
    External,
}

#[derive(Default)]
struct TickState {
    jobs: VecDeque<TickJob>,
    draining: bool,
}

#[derive(Default)]
pub struct NextTickQueue {
    state: Mutex<TickState>,
}

impl NextTickQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Returns true when the queue was empty and idle, i.e. the
    /// caller must start a drain.
    pub fn enqueue(&self, job: TickJob) -> bool {
        let mut state = lock_state(&self.state);
        let wake = state.jobs.is_empty() && !state.draining;
        state.jobs.push_back(job);
        wake
    }

    pub fn len(&self) -> usize {
        lock_state(&self.state).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        lock_state(&self.state).draining
    }

    /// Run batches until the queue is observed empty. Returns the number of
    /// jobs executed.
    ///
    /// The calling thread must not already hold `lock`.
    pub fn drain(&self, lock: &ExecutionLock) -> Result<usize> {
        let mut executed = 0;
        loop {
            {
                let mut state = lock_state(&self.state);
                if state.jobs.is_empty() {
                    state.draining = false;
                    return Ok(executed);
                }
                state.draining = true;
            }

            let mut engine = match lock.acquire() {
                Ok(engine) => engine,
                Err(err) => {
                    lock_state(&self.state).draining = false;
                    return Err(err);
                }
            };
            let batch = std::mem::take(&mut lock_state(&self.state).jobs);
            log::trace!("running next-tick batch of {} jobs", batch.len());

            for job in batch {
                contain("next-tick job", || job(&mut *engine));
                executed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::RecordingEngine;
    use crate::runtime::RuntimeError;
    use std::sync::{Arc, Mutex as StdMutex};

    fn lock() -> ExecutionLock {
        let (engine, _log) = RecordingEngine::new();
        ExecutionLock::new(Box::new(engine))
    }

    fn recorder(order: &Arc<StdMutex<Vec<u32>>>, value: u32) -> TickJob {
        let order = order.clone();
        Box::new(move |_engine: &mut dyn ScriptEngine| order.lock().unwrap().push(value))
    }

    #[test]
    fn test_only_first_enqueue_wakes() {
        let queue = NextTickQueue::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        assert!(queue.enqueue(recorder(&order, 1)));
        assert!(!queue.enqueue(recorder(&order, 2)));
        assert!(!queue.enqueue(recorder(&order, 3)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_drain_runs_fifo_and_resets() {
        let queue = NextTickQueue::new();
        let lock = lock();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 1..=4 {
            queue.enqueue(recorder(&order, i));
        }

        assert_eq!(queue.drain(&lock).unwrap(), 4);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert!(!queue.is_draining());
        assert!(queue.enqueue(recorder(&order, 5)));
    }

    #[test]
    fn test_jobs_enqueued_during_drain_join_the_session() {
        let queue = Arc::new(NextTickQueue::new());
        let lock = lock();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let wakes = Arc::new(StdMutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_order = order.clone();
        let inner_wakes = wakes.clone();
        queue.enqueue(Box::new(move |_engine: &mut dyn ScriptEngine| {
            inner_order.lock().unwrap().push(1);
            let late = recorder(&inner_order, 2);
            inner_wakes.lock().unwrap().push(inner_queue.enqueue(late));
        }));

        assert_eq!(queue.drain(&lock).unwrap(), 2);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(*wakes.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_panicking_job_does_not_drop_the_rest() {
        let queue = NextTickQueue::new();
        let lock = lock();
        let order = Arc::new(StdMutex::new(Vec::new()));
        queue.enqueue(recorder(&order, 1));
        queue.enqueue(Box::new(|_engine: &mut dyn ScriptEngine| panic!("job failed")));
        queue.enqueue(recorder(&order, 3));

        assert_eq!(queue.drain(&lock).unwrap(), 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_drain_while_holding_lock_is_refused() {
        let queue = NextTickQueue::new();
        let lock = lock();
        let order = Arc::new(StdMutex::new(Vec::new()));
        queue.enqueue(recorder(&order, 1));

        let guard = lock.acquire().unwrap();
        assert!(matches!(queue.drain(&lock), Err(RuntimeError::ReentrantLock)));
        drop(guard);

        assert!(!queue.is_draining());
        assert_eq!(queue.drain(&lock).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_enqueues_wake_exactly_once() {
        let queue = Arc::new(NextTickQueue::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                let order = order.clone();
                std::thread::spawn(move || queue.enqueue(recorder(&order, i)))
            })
            .collect();
        let wakes = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|woke| *woke)
            .count();
        assert_eq!(wakes, 1);
        assert_eq!(queue.len(), 8);
    }
}
