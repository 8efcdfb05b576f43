//! State shared between the public handles, the engine context and the run
//! loop of one session.
//!
//! Every table here has its own short-lived lock. None of them is held while
//! the engine runs, with the exception of module registration during
//! initialization.

use crate::runtime::bridge::{AsyncRequestBridge, RequestId, RequestSpec, Transport};
use crate::runtime::config::{LocaleSnapshot, RuntimeConfig};
use crate::runtime::engine::{HostModule, ScriptEngine};
use crate::runtime::events::EventRegistry;
use crate::runtime::graveyard::Graveyard;
use crate::runtime::handles::{CallbackHandle, HandlePair, HandleRegistry, ReceiverHandle};
use crate::runtime::lock::{lock_state, ExecutionLock};
use crate::runtime::next_tick::{NextTickQueue, TickJob, TickOrigin};
use crate::runtime::observers::ReadyObservers;
use crate::runtime::queue::{DelayToken, LoopSender};
use crate::runtime::runner::RuntimeCommand;
use crate::runtime::timers::{Cancellation, TimerId, TimerTable};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

/// Lifecycle of a session. `Ready` and `Paused` are the only states in which
/// the run loop processes messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    Paused,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    /// Whether the session still accepts work.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Created
                | SessionState::Initializing
                | SessionState::Ready
                | SessionState::Paused
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub live_timers: usize,
    pub live_handles: usize,
    pub graveyard_backlog: usize,
    pub pending_jobs: usize,
    pub event_listeners: usize,
    pub in_flight_requests: usize,
    pub worker_dispatches: usize,
    pub rejected_requests: usize,
    pub disposal_failures: usize,
}

#[derive(Default)]
struct ModuleBacklog {
    open: bool,
    pending: Vec<Arc<dyn HostModule>>,
}

pub(crate) struct SessionShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) locale: LocaleSnapshot,
    state: Mutex<SessionState>,
    pub(crate) sender: LoopSender<RuntimeCommand>,
    pub(crate) lock: ExecutionLock,
    pub(crate) registry: HandleRegistry,
    pub(crate) timers: TimerTable,
    pub(crate) graveyard: Graveyard,
    pub(crate) next_tick: NextTickQueue,
    pub(crate) bridge: AsyncRequestBridge,
    pub(crate) events: EventRegistry,
    pub(crate) observers: ReadyObservers,
    modules: Mutex<ModuleBacklog>,
    sweep: Mutex<Option<DelayToken>>,
    pub(crate) owner: OnceCell<ThreadId>,
    pub(crate) thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    pub(crate) fn new(
        config: RuntimeConfig,
        locale: LocaleSnapshot,
        sender: LoopSender<RuntimeCommand>,
        engine: Box<dyn ScriptEngine>,
        transport: Arc<dyn Transport>,
        modules: Vec<Arc<dyn HostModule>>,
    ) -> Self {
        let bridge = AsyncRequestBridge::new(transport, sender.clone(), config.worker_threads);
        Self {
            locale,
            state: Mutex::new(SessionState::Created),
            timers: TimerTable::new(sender.clone()),
            lock: ExecutionLock::new(engine),
            registry: HandleRegistry::new(),
            graveyard: Graveyard::new(),
            next_tick: NextTickQueue::new(),
            bridge,
            events: EventRegistry::new(),
            observers: ReadyObservers::new(),
            modules: Mutex::new(ModuleBacklog {
                open: false,
                pending: modules,
            }),
            sweep: Mutex::new(None),
            owner: OnceCell::new(),
            thread: Mutex::new(None),
            sender,
            config,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock_state(&self.state)
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = lock_state(&self.state);
        if *state != next {
            log::info!("session state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Move from `from` to `to`; no-op returning false from any other state.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = lock_state(&self.state);
        if *state != from {
            return false;
        }
        log::info!("session state {from} -> {to}");
        *state = to;
        true
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state().is_live() && !self.sender.is_closed()
    }

    /// Log and refuse operations on a session that is gone.
    fn ensure_live(&self, operation: &str) -> bool {
        let live = self.is_live();
        if !live {
            log::warn!("{operation} ignored: no live session");
        }
        live
    }

    pub(crate) fn is_owning_thread(&self) -> bool {
        self.owner.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn post_task(&self, job: TickJob, delay: Duration) -> bool {
        if !self.ensure_live("post_task") {
            return false;
        }
        if delay.is_zero() {
            self.sender.post(RuntimeCommand::Task(job))
        } else {
            self.sender
                .post_delayed(RuntimeCommand::Task(job), delay)
                .is_some()
        }
    }

    pub(crate) fn schedule_timer(
        &self,
        pair: HandlePair,
        delay: Duration,
        recurring: bool,
    ) -> Option<TimerId> {
        if !self.ensure_live("schedule_timer") {
            return None;
        }
        // Adopt first: a zero-delay timer may fire before `schedule` returns.
        if !self.registry.adopt(pair) {
            return None;
        }
        let id = self.timers.schedule(pair, delay, recurring);
        if id.is_none() {
            self.graveyard.bury(pair);
        }
        id
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        if !self.ensure_live("cancel_timer") {
            return false;
        }
        match self.timers.cancel(id) {
            Cancellation::Bury(pair) => {
                log::debug!("timer {id} cancelled");
                self.graveyard.bury(pair);
                self.schedule_sweep(false);
                true
            }
            Cancellation::DeferredToFiring => {
                log::debug!("timer {id} cancelled from inside its own callback");
                self.schedule_sweep(false);
                true
            }
            Cancellation::Unknown => {
                log::warn!("could not cancel timer {id}: no such live timer");
                false
            }
        }
    }

    /// Queue a next-tick job and start a drain if this was the first one.
    pub(crate) fn enqueue_next_tick(
        self: &Arc<Self>,
        job: TickJob,
        origin: TickOrigin,
    ) -> bool {
        if !self.ensure_live("enqueue_next_tick") {
            return false;
        }
        let wake = self.next_tick.enqueue(job);
        if wake {
            match origin {
                TickOrigin::External => self.post_drain(),
                TickOrigin::OwningThread => self.spawn_drain_helper(),
            }
        }
        wake
    }

    fn post_drain(&self) {
        if !self.sender.post_urgent(RuntimeCommand::DrainNextTick) {
            log::warn!("next-tick drain could not be posted; session is closing");
        }
    }

    /// The owning thread is busy inside the engine, so the drain waits for
    /// the execution lock on a helper thread instead.
    fn spawn_drain_helper(self: &Arc<Self>) {
        let shared = self.clone();
        let spawned = std::thread::Builder::new()
            .name("jsloop-next-tick".to_string())
            .spawn(move || {
                if let Err(err) = shared.next_tick.drain(&shared.lock) {
                    log::error!("next-tick drain failed: {err}");
                }
            });
        if let Err(err) = spawned {
            log::error!("could not spawn next-tick helper ({err}); posting drain instead");
            self.post_drain();
        }
    }

    pub(crate) fn issue_request(
        &self,
        request: RequestSpec,
        on_success: CallbackHandle,
        on_error: CallbackHandle,
        receiver: ReceiverHandle,
    ) -> Option<RequestId> {
        if !self.ensure_live("issue_request") {
            return None;
        }
        let success = HandlePair::new(on_success, receiver);
        let error = HandlePair::new(on_error, receiver);
        if !self.registry.adopt_all(&[success, error]) {
            return None;
        }

        let id = self.bridge.issue(request, on_success, on_error, receiver);
        if id.is_none() {
            self.graveyard.bury(success);
            self.graveyard.bury(error);
        }
        id
    }

    pub(crate) fn on_event(&self, event: String, pair: HandlePair) -> bool {
        if !self.ensure_live("on_event") {
            return false;
        }
        if !self.registry.adopt(pair) {
            return false;
        }
        self.events.on(event, pair);
        true
    }

    pub(crate) fn off_event(&self, event: &str) -> usize {
        if !self.ensure_live("off_event") {
            return 0;
        }
        let removed = self.events.off(event);
        for pair in &removed {
            self.graveyard.bury(*pair);
        }
        if !removed.is_empty() {
            self.schedule_sweep(false);
        }
        removed.len()
    }

    pub(crate) fn emit(&self, event: String, value: Value) -> bool {
        if !self.ensure_live("emit") {
            return false;
        }
        self.sender.post(RuntimeCommand::EmitEvent { event, value })
    }

    /// Buffered until initialization, afterwards posted to the run loop.
    pub(crate) fn register_module(&self, module: Arc<dyn HostModule>) -> bool {
        if !self.ensure_live("register_module") {
            return false;
        }
        let mut backlog = lock_state(&self.modules);
        if !backlog.open {
            log::debug!("module '{}' queued until initialization", module.name());
            backlog.pending.push(module);
            return true;
        }
        drop(backlog);
        self.sender.post(RuntimeCommand::RegisterModule(module))
    }

    /// Hand over the modules registered before initialization.
    pub(crate) fn open_module_backlog(&self) -> Vec<Arc<dyn HostModule>> {
        let mut backlog = lock_state(&self.modules);
        backlog.open = true;
        std::mem::take(&mut backlog.pending)
    }

    /// Arm a sweep unless one is already pending. A periodic re-arm
    /// (`respect_pause`) is skipped while paused.
    pub(crate) fn schedule_sweep(&self, respect_pause: bool) {
        let mut slot = lock_state(&self.sweep);
        if slot.as_ref().is_some_and(|token| !token.is_settled()) {
            return;
        }
        if respect_pause && self.state() == SessionState::Paused {
            *slot = None;
            return;
        }
        *slot = self
            .sender
            .post_delayed(RuntimeCommand::Sweep, self.config.cleanup_interval());
    }

    fn withdraw_sweep(&self) {
        if let Some(token) = lock_state(&self.sweep).take() {
            token.withdraw();
        }
    }

    pub(crate) fn sweep_now(&self) -> bool {
        if !self.ensure_live("sweep_now") {
            return false;
        }
        self.sender.post(RuntimeCommand::Sweep)
    }

    pub(crate) fn pause(&self) -> bool {
        if !self.transition(SessionState::Ready, SessionState::Paused) {
            return false;
        }
        self.withdraw_sweep();
        true
    }

    pub(crate) fn unpause(&self) -> bool {
        if !self.transition(SessionState::Paused, SessionState::Ready) {
            return false;
        }
        self.schedule_sweep(true);
        true
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        let bridge = self.bridge.stats();
        RuntimeStats {
            live_timers: self.timers.len(),
            live_handles: self.registry.len(),
            graveyard_backlog: self.graveyard.len(),
            pending_jobs: self.next_tick.len(),
            event_listeners: self.events.listener_count(),
            in_flight_requests: bridge.in_flight,
            worker_dispatches: bridge.dispatched,
            rejected_requests: bridge.rejected,
            disposal_failures: self.registry.disposal_failures(),
        }
    }

    /// Post the terminal message. Returns false if the session was already
    /// closed.
    pub(crate) fn begin_shutdown(&self, responder: Option<std::sync::mpsc::Sender<()>>) -> bool {
        if !self.ensure_live("shutdown") {
            return false;
        }
        self.set_state(SessionState::ShuttingDown);
        self.withdraw_sweep();
        self.sender
            .post_terminal(RuntimeCommand::Shutdown { responder })
    }
}
