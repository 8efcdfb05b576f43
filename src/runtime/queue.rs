//! Message plumbing between producer threads and the owning thread.
//!
//! Two unbounded tokio channels feed the run loop: an ordinary lane that keeps
//! FIFO order, and an urgent lane that the receiver always empties first.
//! Delayed messages are small tasks on the loop's own tokio runtime that sleep
//! and then push into the ordinary lane; aborting that task withdraws the
//! message if it has not been delivered yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Withdrawal token for a delayed message.
#[derive(Debug)]
pub(crate) struct DelayToken(AbortHandle);

impl DelayToken {
    /// Best effort: a message that already reached the queue stays there.
    pub(crate) fn withdraw(&self) {
        self.0.abort();
    }

    /// True once the message was delivered or withdrawn.
    pub(crate) fn is_settled(&self) -> bool {
        self.0.is_finished()
    }
}

/// Producer side of the run loop queue; cheap to clone and `Send`.
pub(crate) struct LoopSender<T> {
    ordinary: mpsc::UnboundedSender<T>,
    urgent: mpsc::UnboundedSender<T>,
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for LoopSender<T> {
    fn clone(&self) -> Self {
        Self {
            ordinary: self.ordinary.clone(),
            urgent: self.urgent.clone(),
            runtime: self.runtime.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// Consumer side, owned by the run loop.
pub(crate) struct LoopReceiver<T> {
    ordinary: mpsc::UnboundedReceiver<T>,
    urgent: mpsc::UnboundedReceiver<T>,
}

/// Create a queue whose delayed messages are timed on `runtime`.
pub(crate) fn channel<T>(runtime: Handle) -> (LoopSender<T>, LoopReceiver<T>) {
    let (ordinary_tx, ordinary_rx) = mpsc::unbounded_channel();
    let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
    (
        LoopSender {
            ordinary: ordinary_tx,
            urgent: urgent_tx,
            runtime,
            closed: Arc::new(AtomicBool::new(false)),
        },
        LoopReceiver {
            ordinary: ordinary_rx,
            urgent: urgent_rx,
        },
    )
}

impl<T: Send + 'static> LoopSender<T> {
    /// Append to the ordinary lane. Returns false if the queue is closed.
    pub(crate) fn post(&self, message: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.ordinary.send(message).is_ok()
    }

    /// Append to the urgent lane, ahead of every ordinary message.
    pub(crate) fn post_urgent(&self, message: T) -> bool {
        if self.is_closed() {
            return false;
        }
        self.urgent.send(message).is_ok()
    }

    /// Deliver `message` to the ordinary lane no earlier than `delay` from now.
    pub(crate) fn post_delayed(&self, message: T, delay: Duration) -> Option<DelayToken> {
        if self.is_closed() {
            return None;
        }
        let lane = self.ordinary.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = lane.send(message);
        });
        Some(DelayToken(task.abort_handle()))
    }

    /// Post the last message this queue will accept, then close it.
    ///
    /// Returns false if the queue had already been closed.
    pub(crate) fn post_terminal(&self, message: T) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ordinary.send(message).is_ok()
    }

    /// Refuse every further message without posting anything.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> LoopReceiver<T> {
    /// Next message, urgent lane first. `None` once both lanes are closed.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            Some(message) = self.urgent.recv() => Some(message),
            message = self.ordinary.recv() => message,
        }
    }
}
