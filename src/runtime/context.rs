//! Engine-side view of a session.
//!
//! The engine receives an [`EngineContext`] at initialization and uses it to
//! implement its script primitives (`setTimeout`, `nextTick`, requests,
//! event subscriptions). Calls made through the context are assumed to come
//! from script code on the owning thread, so next-tick drains are started on
//! a helper thread rather than on the loop.
//!
//! The context holds a weak reference: once the session is gone every call is
//! a logged no-op.

use crate::runtime::bridge::{RequestId, RequestSpec};
use crate::runtime::config::LocaleSnapshot;
use crate::runtime::handles::{CallbackHandle, HandlePair, ReceiverHandle};
use crate::runtime::next_tick::{TickJob, TickOrigin};
use crate::runtime::session::{SessionShared, SessionState};
use crate::runtime::timers::TimerId;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone)]
pub struct EngineContext {
    shared: Weak<SessionShared>,
}

impl EngineContext {
    pub(crate) fn new(shared: &Arc<SessionShared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn session(&self) -> Option<Arc<SessionShared>> {
        let shared = self.shared.upgrade();
        if shared.is_none() {
            log::warn!("engine context used after its session was dropped");
        }
        shared
    }

    /// Schedule `pair` to run after `delay`, repeatedly if `recurring`.
    pub fn schedule_timer(
        &self,
        pair: HandlePair,
        delay: Duration,
        recurring: bool,
    ) -> Option<TimerId> {
        self.session()?.schedule_timer(pair, delay, recurring)
    }

    /// Safe to call from inside the timer's own callback.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.session().is_some_and(|shared| shared.cancel_timer(id))
    }

    pub fn enqueue_next_tick(&self, job: TickJob) -> bool {
        self.session()
            .is_some_and(|shared| shared.enqueue_next_tick(job, TickOrigin::OwningThread))
    }

    pub fn issue_request(
        &self,
        request: RequestSpec,
        on_success: CallbackHandle,
        on_error: CallbackHandle,
        receiver: ReceiverHandle,
    ) -> Option<RequestId> {
        self.session()?
            .issue_request(request, on_success, on_error, receiver)
    }

    pub fn on_event(&self, event: impl Into<String>, pair: HandlePair) -> bool {
        self.session()
            .is_some_and(|shared| shared.on_event(event.into(), pair))
    }

    /// Drop every listener of `event`. Returns how many were removed.
    pub fn off_event(&self, event: &str) -> usize {
        self.session().map_or(0, |shared| shared.off_event(event))
    }

    pub fn locale(&self) -> Option<LocaleSnapshot> {
        self.shared.upgrade().map(|shared| shared.locale.clone())
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .upgrade()
            .map_or(SessionState::Terminated, |shared| shared.state())
    }
}
