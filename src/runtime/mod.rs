//! Single-owner run loop for an embedded script engine.
//!
//! The engine is not thread-safe, so one dedicated OS thread owns it and runs
//! a Tokio current-thread loop over a two-lane message queue. Everything else
//! (timers, next-tick jobs, blocking requests, host events, deferred handle
//! disposal) reaches the engine through that queue or through the
//! [`ExecutionLock`](lock::ExecutionLock).

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod graveyard;
pub mod handle;
pub mod handles;
pub mod lock;
pub mod next_tick;
pub mod observers;
mod queue;
mod runner;
pub mod session;
pub mod timers;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use bridge::{Completion, PreparedRequest, RequestId, RequestSpec, Transport};
pub use config::{FormFactor, LocaleSnapshot, RuntimeConfig};
pub use context::EngineContext;
pub use engine::{EngineEnvironment, HostModule, ScriptEngine};
pub use error::{EngineError, Result, RuntimeError};
pub use handle::{RuntimeBuilder, RuntimeHandle};
pub use handles::{CallbackHandle, HandlePair, ReceiverHandle};
pub use next_tick::TickJob;
pub use observers::{ObserverId, ReadyObserver};
pub use session::{RuntimeStats, SessionState};
pub use timers::TimerId;
