//! Public handle for talking to a session from any thread.

use crate::runtime::bridge::{NoTransport, RequestId, RequestSpec, Transport};
use crate::runtime::config::{LocaleSnapshot, RuntimeConfig};
use crate::runtime::engine::{HostModule, ScriptEngine};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handles::{CallbackHandle, HandlePair, ReceiverHandle};
use crate::runtime::lock::{lock_state, EngineGuard};
use crate::runtime::next_tick::{TickJob, TickOrigin};
use crate::runtime::observers::{ObserverId, ReadyObserver};
use crate::runtime::runner::{spawn_runtime_thread, RuntimeCommand};
use crate::runtime::session::{RuntimeStats, SessionShared, SessionState};
use crate::runtime::timers::TimerId;
use serde_json::Value;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Collects what a session needs before its thread starts.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    modules: Vec<Arc<dyn HostModule>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            transport: Arc::new(NoTransport),
            modules: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Registered before the entry script is required.
    pub fn with_module(mut self, module: Arc<dyn HostModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn spawn(self, engine: impl ScriptEngine + 'static) -> Result<RuntimeHandle> {
        let shared =
            spawn_runtime_thread(self.config, Box::new(engine), self.transport, self.modules)?;
        Ok(RuntimeHandle { shared })
    }
}

/// Cloneable, thread-safe handle to one engine session.
///
/// Initialization continues in the background after [`spawn`](Self::spawn)
/// returns; use [`add_ready_observer`](Self::add_ready_observer) or
/// [`wait_until_ready`](Self::wait_until_ready) to find out when it is done.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<SessionShared>,
}

impl RuntimeHandle {
    /// Start a session without a transport; every request fails with status 500.
    pub fn spawn(config: RuntimeConfig, engine: impl ScriptEngine + 'static) -> Result<Self> {
        RuntimeBuilder::new(config).spawn(engine)
    }

    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.observers.is_ready()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.is_live()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn locale(&self) -> &LocaleSnapshot {
        &self.shared.locale
    }

    /// Called once when the engine is ready, or right away if it already is.
    pub fn add_ready_observer(&self, observer: impl ReadyObserver + 'static) -> ObserverId {
        self.shared.observers.add(Arc::new(observer))
    }

    pub fn remove_ready_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove(id)
    }

    /// Block until ready. Returns false on timeout or if the session died
    /// during initialization.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let id = self.add_ready_observer(move || {
            let _ = lock_state(&tx).send(());
        });
        let ready = rx.recv_timeout(timeout).is_ok();
        if !ready {
            self.remove_ready_observer(id);
        }
        ready
    }

    /// Run `job` on the owning thread after `delay` (immediately if zero),
    /// behind everything already queued.
    pub fn post_task<F>(&self, delay: Duration, job: F) -> bool
    where
        F: FnOnce(&mut dyn ScriptEngine) + Send + 'static,
    {
        self.shared.post_task(Box::new(job), delay)
    }

    pub fn schedule_timer(
        &self,
        pair: HandlePair,
        delay: Duration,
        recurring: bool,
    ) -> Option<TimerId> {
        self.shared.schedule_timer(pair, delay, recurring)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.cancel_timer(id)
    }

    /// True until the timer is cancelled or its last firing has returned.
    pub fn is_timer_live(&self, id: TimerId) -> bool {
        self.shared.timers.is_live(id)
    }

    /// Queue a job that runs before any ordinary message posted afterwards.
    pub fn enqueue_next_tick<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut dyn ScriptEngine) + Send + 'static,
    {
        let job: TickJob = Box::new(job);
        let origin = if self.shared.is_owning_thread() {
            TickOrigin::OwningThread
        } else {
            TickOrigin::External
        };
        self.shared.enqueue_next_tick(job, origin)
    }

    pub fn issue_request(
        &self,
        request: RequestSpec,
        on_success: CallbackHandle,
        on_error: CallbackHandle,
        receiver: ReceiverHandle,
    ) -> Option<RequestId> {
        self.shared
            .issue_request(request, on_success, on_error, receiver)
    }

    pub fn on_event(&self, event: impl Into<String>, pair: HandlePair) -> bool {
        self.shared.on_event(event.into(), pair)
    }

    pub fn off_event(&self, event: &str) -> usize {
        self.shared.off_event(event)
    }

    /// Deliver `value` to every listener of `event` on the owning thread.
    pub fn emit(&self, event: impl Into<String>, value: Value) -> bool {
        self.shared.emit(event.into(), value)
    }

    pub fn emit_bool(&self, event: impl Into<String>, value: bool) -> bool {
        self.emit(event, Value::Bool(value))
    }

    pub fn register_module(&self, module: Arc<dyn HostModule>) -> bool {
        self.shared.register_module(module)
    }

    fn sender(&self) -> Result<&crate::runtime::queue::LoopSender<RuntimeCommand>> {
        if !self.shared.is_live() {
            return Err(RuntimeError::ShutDown);
        }
        Ok(&self.shared.sender)
    }

    fn refuse_on_owning_thread(&self) -> Result<()> {
        if self.shared.is_owning_thread() {
            return Err(RuntimeError::ReentrantLock);
        }
        Ok(())
    }

    /// Evaluate `source` on the owning thread and wait for the result.
    pub fn run_script(&self, source: &str, name: &str) -> Result<Value> {
        self.refuse_on_owning_thread()?;
        let (result_tx, result_rx) = mpsc::channel();
        let posted = self.sender()?.post(RuntimeCommand::RunScript {
            source: source.to_string(),
            name: name.to_string(),
            responder: result_tx,
        });
        if !posted {
            return Err(RuntimeError::ShutDown);
        }
        result_rx.recv().map_err(|_| RuntimeError::Disconnected)?
    }

    pub async fn run_script_async(&self, source: &str, name: &str) -> Result<Value> {
        let (result_tx, result_rx) = oneshot::channel();
        let posted = self.sender()?.post(RuntimeCommand::RunScriptAsync {
            source: source.to_string(),
            name: name.to_string(),
            responder: result_tx,
        });
        if !posted {
            return Err(RuntimeError::ShutDown);
        }
        result_rx.await.map_err(|_| RuntimeError::Disconnected)?
    }

    pub fn require(&self, path: &str) -> Result<Value> {
        self.refuse_on_owning_thread()?;
        let (result_tx, result_rx) = mpsc::channel();
        let posted = self.sender()?.post(RuntimeCommand::Require {
            path: path.to_string(),
            responder: result_tx,
        });
        if !posted {
            return Err(RuntimeError::ShutDown);
        }
        result_rx.recv().map_err(|_| RuntimeError::Disconnected)?
    }

    /// Take the execution lock directly, e.g. to call into the engine from a
    /// host thread. Fails with [`RuntimeError::ReentrantLock`] if this
    /// thread already holds it.
    pub fn lock(&self) -> Result<EngineGuard<'_>> {
        if !self.shared.is_live() {
            return Err(RuntimeError::ShutDown);
        }
        self.shared.lock.acquire()
    }

    /// Suspend periodic graveyard sweeps. Only valid while ready.
    pub fn pause(&self) -> bool {
        self.shared.pause()
    }

    pub fn unpause(&self) -> bool {
        self.shared.unpause()
    }

    /// Queue a sweep behind everything already posted.
    pub fn sweep_now(&self) -> bool {
        self.shared.sweep_now()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// Stop the session: pending messages posted before this call still run,
    /// then remaining handles are disposed and the owning thread exits.
    ///
    /// From the owning thread itself this only posts the terminal message.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.is_owning_thread() {
            return if self.shared.begin_shutdown(None) {
                Ok(())
            } else {
                Err(RuntimeError::ShutDown)
            };
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        if !self.shared.begin_shutdown(Some(ack_tx)) {
            return Err(RuntimeError::ShutDown);
        }
        ack_rx.recv().map_err(|_| RuntimeError::Disconnected)?;

        if let Some(thread) = lock_state(&self.shared.thread).take() {
            if thread.join().is_err() {
                log::error!("engine thread panicked during shutdown");
            }
        }
        Ok(())
    }
}
