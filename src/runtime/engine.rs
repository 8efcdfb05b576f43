//! Boundary to the embedded script engine.
//!
//! The interpreter itself lives outside this crate. The runtime only needs the
//! handful of entry points below, and it promises to call every one of them
//! from behind the [`ExecutionLock`](crate::runtime::lock::ExecutionLock).

use crate::runtime::config::{FormFactor, LocaleSnapshot};
use crate::runtime::context::EngineContext;
use crate::runtime::error::EngineError;
use crate::runtime::handles::HandlePair;
use serde_json::Value;
use std::sync::Arc;

/// Everything the engine learns about its host at initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEnvironment {
    pub locale: LocaleSnapshot,
    pub density: f32,
    pub form_factor: FormFactor,
}

/// A named capability object exposed to scripts (storage, sockets, ...).
pub trait HostModule: Send + Sync {
    fn name(&self) -> &str;
}

/// The non-thread-safe interpreter the runtime serializes access to.
///
/// Every registration (timer, request callback, event listener) takes
/// ownership of a fresh [`HandlePair`] and later disposes it exactly once.
/// Registering a pair that is still live is refused, so the engine mints a
/// new pair per registration and may reuse one only after `dispose` has been
/// called for it.
pub trait ScriptEngine: Send {
    /// Bring the interpreter up. Called once, on the owning thread.
    ///
    /// `context` stays valid for the life of the session and is how script
    /// primitives reach timers, next-tick jobs, requests and events.
    fn initialize(
        &mut self,
        environment: &EngineEnvironment,
        context: EngineContext,
    ) -> Result<(), EngineError>;

    /// Call `pair.callback` with `pair.receiver` as `this`.
    fn invoke(&mut self, pair: HandlePair, args: &[Value]) -> Result<(), EngineError>;

    /// Release both references of `pair`.
    fn dispose(&mut self, pair: HandlePair) -> Result<(), EngineError>;

    fn register_module(&mut self, module: Arc<dyn HostModule>) -> Result<(), EngineError>;

    fn run_script(&mut self, source: &str, name: &str) -> Result<Value, EngineError>;

    fn require(&mut self, path: &str) -> Result<Value, EngineError>;
}
