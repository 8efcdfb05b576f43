//! Error types for the runtime and for the engine it hosts.

use crate::runtime::handles::HandlePair;
use thiserror::Error;

/// Failure reported by the embedded script engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Script compilation or execution raised.
    #[error("script error: {0}")]
    Script(String),
    /// Releasing a handle failed.
    #[error("disposal failed: {0}")]
    Disposal(String),
    /// The engine could not be brought up.
    #[error("engine initialization failed: {0}")]
    Init(String),
}

/// Errors surfaced by the runtime to its callers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("missing required resource: {0}")]
    MissingResource(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("runtime has been shut down")]
    ShutDown,

    #[error("execution lock is already held by the current thread")]
    ReentrantLock,

    #[error("handle {0} is not live")]
    RetiredHandle(HandlePair),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runtime thread did not respond")]
    Disconnected,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
