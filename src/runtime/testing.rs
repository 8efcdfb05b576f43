//! Test doubles shared by the unit and scenario tests.

use crate::runtime::bridge::{Completion, PreparedRequest, Transport};
use crate::runtime::context::EngineContext;
use crate::runtime::engine::{EngineEnvironment, HostModule, ScriptEngine};
use crate::runtime::error::EngineError;
use crate::runtime::handles::{CallbackHandle, HandlePair, ReceiverHandle};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn pair(n: u64) -> HandlePair {
    HandlePair::new(CallbackHandle::from_raw(n), ReceiverHandle::from_raw(n + 1000))
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineEvent {
    Initialized,
    Invoked(HandlePair, Vec<Value>),
    Disposed(HandlePair),
    Module(String),
    Script(String),
    Required(String),
}

#[derive(Default)]
struct LogState {
    events: Vec<EngineEvent>,
    inside: usize,
    max_inside: usize,
}

/// Shared view of everything a [`RecordingEngine`] saw.
#[derive(Clone, Default)]
pub(crate) struct EngineLog {
    state: Arc<Mutex<LogState>>,
}

impl EngineLog {
    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: EngineEvent) {
        self.state().events.push(event);
    }

    pub(crate) fn events(&self) -> Vec<EngineEvent> {
        self.state().events.clone()
    }

    pub(crate) fn invocations_of(&self, pair: HandlePair) -> Vec<Vec<Value>> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Invoked(p, args) if *p == pair => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn invoked(&self) -> Vec<HandlePair> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Invoked(p, _) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn disposed(&self) -> Vec<HandlePair> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Disposed(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Highest number of engine calls observed running at the same time.
    pub(crate) fn max_concurrent_calls(&self) -> usize {
        self.state().max_inside
    }

    fn enter(&self) {
        let mut state = self.state();
        state.inside += 1;
        state.max_inside = state.max_inside.max(state.inside);
    }

    fn leave(&self) {
        self.state().inside -= 1;
    }
}

pub(crate) type InvokeHook = Arc<dyn Fn(&EngineContext, HandlePair, &[Value]) + Send + Sync>;

/// Engine that records every call and can be told to misbehave.
pub(crate) struct RecordingEngine {
    log: EngineLog,
    context: Option<EngineContext>,
    fail_dispose: HashSet<HandlePair>,
    panic_dispose: HashSet<HandlePair>,
    hook: Option<InvokeHook>,
    fail_init: bool,
    call_delay: Duration,
}

impl RecordingEngine {
    pub(crate) fn new() -> (Self, EngineLog) {
        let log = EngineLog::default();
        let engine = Self {
            log: log.clone(),
            context: None,
            fail_dispose: HashSet::new(),
            panic_dispose: HashSet::new(),
            hook: None,
            fail_init: false,
            call_delay: Duration::ZERO,
        };
        (engine, log)
    }

    pub(crate) fn fail_dispose_of(&mut self, pair: HandlePair) {
        self.fail_dispose.insert(pair);
    }

    pub(crate) fn panic_on_dispose_of(&mut self, pair: HandlePair) {
        self.panic_dispose.insert(pair);
    }

    /// Run `hook` after every invocation, with the session context.
    pub(crate) fn with_hook(
        mut self,
        hook: impl Fn(&EngineContext, HandlePair, &[Value]) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Make every invocation take at least `delay`.
    pub(crate) fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }
}

impl ScriptEngine for RecordingEngine {
    fn initialize(
        &mut self,
        _environment: &EngineEnvironment,
        context: EngineContext,
    ) -> Result<(), EngineError> {
        if self.fail_init {
            return Err(EngineError::Init("refused by test".to_string()));
        }
        self.context = Some(context);
        self.log.record(EngineEvent::Initialized);
        Ok(())
    }

    fn invoke(&mut self, pair: HandlePair, args: &[Value]) -> Result<(), EngineError> {
        self.log.enter();
        if !self.call_delay.is_zero() {
            std::thread::sleep(self.call_delay);
        }
        self.log.record(EngineEvent::Invoked(pair, args.to_vec()));
        if let (Some(hook), Some(context)) = (&self.hook, &self.context) {
            (**hook)(context, pair, args);
        }
        self.log.leave();
        Ok(())
    }

    fn dispose(&mut self, pair: HandlePair) -> Result<(), EngineError> {
        if self.panic_dispose.contains(&pair) {
            panic!("dispose of {pair} blew up");
        }
        if self.fail_dispose.contains(&pair) {
            return Err(EngineError::Disposal(format!("{pair} refused")));
        }
        self.log.record(EngineEvent::Disposed(pair));
        Ok(())
    }

    fn register_module(&mut self, module: Arc<dyn HostModule>) -> Result<(), EngineError> {
        self.log.record(EngineEvent::Module(module.name().to_string()));
        Ok(())
    }

    fn run_script(&mut self, source: &str, name: &str) -> Result<Value, EngineError> {
        self.log.record(EngineEvent::Script(name.to_string()));
        match source.strip_prefix("throw ") {
            Some(message) => Err(EngineError::Script(message.to_string())),
            None => Ok(json!({ "name": name, "length": source.len() })),
        }
    }

    fn require(&mut self, path: &str) -> Result<Value, EngineError> {
        self.log.record(EngineEvent::Required(path.to_string()));
        Ok(Value::Null)
    }
}

pub(crate) struct NamedModule(pub &'static str);

impl HostModule for NamedModule {
    fn name(&self) -> &str {
        self.0
    }
}

type Responder = Box<dyn Fn(&PreparedRequest) -> Completion + Send + Sync>;

/// Transport that answers from a closure and counts calls.
pub(crate) struct ScriptedTransport {
    respond: Responder,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(
        respond: impl Fn(&PreparedRequest) -> Completion + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ok(payload: &'static str) -> Self {
        Self::new(move |_request: &PreparedRequest| Completion::success(payload, 200))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: &PreparedRequest) -> Completion {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}
