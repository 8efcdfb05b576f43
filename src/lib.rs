//! `jsloop`: a single-owner run loop for embedding a non-thread-safe script
//! engine in a multi-threaded host.

pub mod runtime;

pub use runtime::{
    CallbackHandle, Completion, EngineContext, EngineError, HandlePair, HostModule, ReceiverHandle,
    RequestSpec, RuntimeBuilder, RuntimeConfig, RuntimeError, RuntimeHandle, ScriptEngine,
    SessionState, TimerId, Transport,
};
