//! The owning thread and its run loop.
//!
//! [`spawn_runtime_thread`] starts a dedicated OS thread with a
//! single-threaded Tokio runtime. The thread brings the engine up, posts the
//! readiness message to the front of the queue, and then handles
//! [`RuntimeCommand`]s one at a time until the terminal `Shutdown` arrives.

use crate::runtime::bridge::{AsyncCallRecord, Transport};
use crate::runtime::config::{LocaleSnapshot, RuntimeConfig};
use crate::runtime::context::EngineContext;
use crate::runtime::engine::{EngineEnvironment, HostModule, ScriptEngine};
use crate::runtime::error::{EngineError, Result, RuntimeError};
use crate::runtime::lock::{contain, lock_state};
use crate::runtime::next_tick::TickJob;
use crate::runtime::queue::{self, LoopReceiver};
use crate::runtime::session::{SessionShared, SessionState};
use crate::runtime::timers::{FiringOutcome, TimerId};
use serde_json::Value;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Messages handled by the run loop.
pub(crate) enum RuntimeCommand {
    /// Initialization finished; notify readiness observers.
    Ready,
    /// Dispose everything in the graveyard.
    Sweep,
    FireTimer(TimerId),
    /// Drain next-tick jobs queued from outside the owning thread.
    DrainNextTick,
    RequestDone(Box<AsyncCallRecord>),
    EmitEvent {
        event: String,
        value: Value,
    },
    RegisterModule(Arc<dyn HostModule>),
    Task(TickJob),
    RunScript {
        source: String,
        name: String,
        responder: Sender<Result<Value>>,
    },
    RunScriptAsync {
        source: String,
        name: String,
        responder: oneshot::Sender<Result<Value>>,
    },
    Require {
        path: String,
        responder: Sender<Result<Value>>,
    },
    Shutdown {
        responder: Option<Sender<()>>,
    },
}

pub(crate) fn spawn_runtime_thread(
    config: RuntimeConfig,
    engine: Box<dyn ScriptEngine>,
    transport: Arc<dyn Transport>,
    modules: Vec<Arc<dyn HostModule>>,
) -> Result<Arc<SessionShared>> {
    config.validate()?;
    let locale = LocaleSnapshot::capture(&config);

    // Built here so delayed messages can be armed before the thread runs.
    let tokio_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(RuntimeError::Spawn)?;
    let (sender, receiver) = queue::channel(tokio_rt.handle().clone());

    let shared = Arc::new(SessionShared::new(
        config, locale, sender, engine, transport, modules,
    ));
    shared.set_state(SessionState::Initializing);

    let thread_shared = shared.clone();
    let thread = std::thread::Builder::new()
        .name("jsloop-engine".to_string())
        .spawn(move || {
            let core = RuntimeCore::new(thread_shared);
            if let Err(err) = core.initialize() {
                log::error!("engine initialization failed: {err}");
                core.abandon();
                return;
            }
            tokio_rt.block_on(core.run(receiver));
        })
        .map_err(|err| {
            shared.sender.close();
            shared.set_state(SessionState::Terminated);
            RuntimeError::Spawn(err)
        })?;

    *lock_state(&shared.thread) = Some(thread);
    Ok(shared)
}

struct RuntimeCore {
    shared: Arc<SessionShared>,
}

impl RuntimeCore {
    fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Runs on the owning thread before the loop starts.
    fn initialize(&self) -> Result<()> {
        let shared = &self.shared;
        let _ = shared.owner.set(std::thread::current().id());

        let delay = shared.config.startup_delay();
        if !delay.is_zero() {
            log::debug!("delaying engine start by {delay:?}");
            std::thread::sleep(delay);
        }

        let environment = EngineEnvironment {
            locale: shared.locale.clone(),
            density: shared.config.density,
            form_factor: shared.config.form_factor,
        };
        log::info!(
            "initializing engine (locale {}, timezone {}, {})",
            environment.locale.locale,
            environment.locale.timezone,
            environment.form_factor.as_str()
        );

        {
            let mut engine = shared.lock.acquire()?;
            engine.initialize(&environment, EngineContext::new(shared))?;

            for module in shared.open_module_backlog() {
                if let Err(err) = engine.register_module(module.clone()) {
                    log::warn!("module '{}' could not be registered: {err}", module.name());
                }
            }

            if let Some(path) = &shared.config.script_path {
                match engine.require(path) {
                    Ok(_) => log::info!("entry script '{path}' loaded"),
                    Err(err) => log::error!("entry script '{path}' failed: {err}"),
                }
            }
        }

        shared.sender.post_urgent(RuntimeCommand::Ready);
        shared.schedule_sweep(true);
        Ok(())
    }

    /// Initialization failed: nothing will ever run on this session.
    fn abandon(&self) {
        self.shared.sender.close();
        self.shared.set_state(SessionState::Terminated);
    }

    async fn run(self, mut rx: LoopReceiver<RuntimeCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RuntimeCommand::Ready => self.on_ready(),
                RuntimeCommand::Sweep => self.sweep(),
                RuntimeCommand::FireTimer(id) => self.fire_timer(id),
                RuntimeCommand::DrainNextTick => self.drain_next_tick(),
                RuntimeCommand::RequestDone(record) => self.deliver_request(*record),
                RuntimeCommand::EmitEvent { event, value } => self.emit(&event, value),
                RuntimeCommand::RegisterModule(module) => {
                    let name = module.name().to_string();
                    if let Some(Err(err)) =
                        self.with_engine("module registration", |engine| engine.register_module(module))
                    {
                        log::warn!("module '{name}' could not be registered: {err}");
                    }
                }
                RuntimeCommand::Task(job) => {
                    self.with_engine("posted task", job);
                }
                RuntimeCommand::RunScript {
                    source,
                    name,
                    responder,
                } => {
                    let _ = responder.send(self.run_script(&source, &name));
                }
                RuntimeCommand::RunScriptAsync {
                    source,
                    name,
                    responder,
                } => {
                    let _ = responder.send(self.run_script(&source, &name));
                }
                RuntimeCommand::Require { path, responder } => {
                    let result = self.with_engine("require", |engine| engine.require(&path));
                    let _ = responder.send(engine_result(result, &path));
                }
                RuntimeCommand::Shutdown { responder } => {
                    self.shutdown();
                    if let Some(responder) = responder {
                        let _ = responder.send(());
                    }
                    break;
                }
            }
        }

        self.shared.set_state(SessionState::Terminated);
        log::info!("engine run loop terminated");
    }

    /// Run `f` with the engine under the execution lock. Panics are contained
    /// and reported as `None`.
    fn with_engine<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut dyn ScriptEngine) -> R,
    ) -> Option<R> {
        let mut engine = match self.shared.lock.acquire() {
            Ok(engine) => engine,
            Err(err) => {
                log::error!("{what} skipped: {err}");
                return None;
            }
        };
        contain(what, || f(&mut *engine))
    }

    fn on_ready(&self) {
        if !self
            .shared
            .transition(SessionState::Initializing, SessionState::Ready)
        {
            log::debug!("readiness ignored in state {}", self.shared.state());
            return;
        }
        let notified = self.shared.observers.broadcast();
        log::info!("engine ready ({notified} observers notified)");
    }

    fn sweep(&self) {
        let shared = &self.shared;
        if let Some(report) = self.with_engine("graveyard sweep", |engine| {
            shared.graveyard.sweep(&shared.registry, engine)
        }) {
            log::trace!("sweep: {report:?}");
        }
        shared.schedule_sweep(true);
    }

    fn fire_timer(&self, id: TimerId) {
        let shared = &self.shared;
        let Some(entry) = shared.timers.begin_firing(id) else {
            log::trace!("timer {id} fired after cancellation; skipped");
            return;
        };

        if entry.is_dead() {
            log::debug!("timer {id} was cancelled before its callback ran");
        } else {
            let invoked = self.with_engine("timer callback", |engine| {
                shared.registry.invoke(engine, entry.pair, &[])
            });
            if let Some(Err(err)) = invoked {
                log::warn!("timer {id} callback failed: {err}");
            }
        }

        if let FiringOutcome::Retire(pair) = shared.timers.finish_firing(&entry) {
            shared.graveyard.bury(pair);
        }
    }

    fn drain_next_tick(&self) {
        match self.shared.next_tick.drain(&self.shared.lock) {
            Ok(executed) => log::trace!("drained {executed} next-tick jobs"),
            Err(err) => log::error!("next-tick drain failed: {err}"),
        }
    }

    fn deliver_request(&self, record: AsyncCallRecord) {
        let shared = &self.shared;
        shared.bridge.delivered();

        let (pair, args) = record.delivery();
        log::debug!("delivering request {} to {pair}", record.id);
        let invoked = self.with_engine("request callback", |engine| {
            shared.registry.invoke(engine, pair, &args)
        });
        if let Some(Err(err)) = invoked {
            log::warn!("request {} callback failed: {err}", record.id);
        }

        shared.graveyard.bury(record.success_pair());
        shared.graveyard.bury(record.error_pair());
    }

    fn emit(&self, event: &str, value: Value) {
        let shared = &self.shared;
        let listeners = shared.events.listeners(event);
        if listeners.is_empty() {
            log::debug!("no listeners for event '{event}'");
            return;
        }

        let args = [value];
        self.with_engine("event dispatch", |engine| {
            for pair in listeners {
                if let Some(Err(err)) =
                    contain("event listener", || shared.registry.invoke(engine, pair, &args))
                {
                    log::warn!("listener {pair} for '{event}' failed: {err}");
                }
            }
        });
    }

    fn run_script(&self, source: &str, name: &str) -> Result<Value> {
        let result = self.with_engine("script", |engine| engine.run_script(source, name));
        engine_result(result, name)
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        shared.set_state(SessionState::ShuttingDown);

        let leftover = shared.timers.clear();
        if !leftover.is_empty() {
            log::warn!("{} timers still live at shutdown", leftover.len());
        }
        for pair in leftover.into_iter().chain(shared.events.clear()) {
            shared.graveyard.bury(pair);
        }

        if !shared.next_tick.is_empty() {
            log::debug!("running {} next-tick jobs before shutdown", shared.next_tick.len());
            self.drain_next_tick();
        }

        if let Some(report) = self.with_engine("final sweep", |engine| {
            shared.graveyard.sweep(&shared.registry, engine)
        }) {
            log::info!(
                "shutdown sweep disposed {} handle pairs ({} failed)",
                report.disposed,
                report.failed
            );
        }
        if !shared.registry.is_empty() {
            log::warn!("{} handle pairs still live after shutdown", shared.registry.len());
        }
    }
}

fn engine_result(result: Option<std::result::Result<Value, EngineError>>, what: &str) -> Result<Value> {
    match result {
        Some(value) => Ok(value?),
        None => Err(EngineError::Script(format!("'{what}' panicked")).into()),
    }
}
