//! Blocking external requests, marshalled back onto the owning thread.
//!
//! A request is validated on the calling thread. Malformed input never leaves
//! it: the error completion is posted straight to the run loop. Valid requests
//! run on a worker (pool or ad-hoc thread), which fills in an
//! [`AsyncCallRecord`] and posts it back. Callbacks are only ever invoked by
//! the run loop.

use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::handles::{CallbackHandle, HandlePair, ReceiverHandle};
use crate::runtime::lock::contain;
use crate::runtime::queue::LoopSender;
use crate::runtime::runner::RuntimeCommand;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// Status reported when a request never reached the transport or the
/// transport itself failed.
pub const CLIENT_FAILURE_STATUS: u16 = 500;

const SUPPORTED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Request descriptor as handed over by script code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub target: String,
    pub payload: Option<String>,
    pub method: String,
    /// Ask the engine to post-process the response payload (e.g. parse JSON).
    pub process_data: bool,
}

impl RequestSpec {
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payload: None,
            method: "GET".to_string(),
            process_data: false,
        }
    }

    pub fn post(target: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payload: Some(payload.into()),
            method: "POST".to_string(),
            process_data: false,
        }
    }

    pub fn with_process_data(mut self, process: bool) -> Self {
        self.process_data = process;
        self
    }

    /// Validate and normalize into what the transport receives.
    pub fn prepare(&self) -> Result<PreparedRequest> {
        let target = self.target.trim();
        let url = Url::parse(target)
            .map_err(|err| RuntimeError::MalformedRequest(format!("'{target}': {err}")))?;
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(RuntimeError::MalformedRequest(format!(
                    "'{target}' has no host"
                )))
            }
        };

        let method = if self.method.trim().is_empty() {
            "GET".to_string()
        } else {
            self.method.trim().to_ascii_uppercase()
        };
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            return Err(RuntimeError::MalformedRequest(format!(
                "unsupported method '{method}'"
            )));
        }

        Ok(PreparedRequest {
            scheme: url.scheme().to_string(),
            host,
            url,
            method,
            payload: self.payload.clone(),
        })
    }
}

/// A validated request, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub url: Url,
    pub scheme: String,
    pub host: String,
    pub method: String,
    pub payload: Option<String>,
}

/// What came back from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub payload: Option<String>,
    pub status: u16,
    pub success: bool,
}

impl Completion {
    pub fn success(payload: impl Into<String>, status: u16) -> Self {
        Self {
            payload: Some(payload.into()),
            status,
            success: true,
        }
    }

    pub fn failure(payload: Option<String>, status: u16) -> Self {
        Self {
            payload,
            status,
            success: false,
        }
    }

    /// Arguments handed to the success or error callback.
    pub fn callback_args(&self, process_data: bool) -> Vec<Value> {
        vec![
            self.payload.clone().map(Value::String).unwrap_or(Value::Null),
            Value::from(self.status),
            Value::Bool(process_data),
        ]
    }
}

/// The blocking network (or storage) call. Runs on worker threads only.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &PreparedRequest) -> Completion;
}

/// Transport used when none is configured; every request fails.
#[derive(Debug, Default)]
pub struct NoTransport;

impl Transport for NoTransport {
    fn execute(&self, request: &PreparedRequest) -> Completion {
        log::warn!("no transport configured, failing {} {}", request.method, request.url);
        Completion::failure(None, CLIENT_FAILURE_STATUS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One in-flight request. Written once by the worker, consumed once by the
/// run loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncCallRecord {
    pub id: RequestId,
    pub request: RequestSpec,
    pub on_success: CallbackHandle,
    pub on_error: CallbackHandle,
    pub receiver: ReceiverHandle,
    pub completion: Option<Completion>,
}

impl AsyncCallRecord {
    pub fn success_pair(&self) -> HandlePair {
        HandlePair::new(self.on_success, self.receiver)
    }

    pub fn error_pair(&self) -> HandlePair {
        HandlePair::new(self.on_error, self.receiver)
    }

    /// The pair to invoke for this record's completion, with its arguments.
    pub fn delivery(&self) -> (HandlePair, Vec<Value>) {
        match &self.completion {
            Some(completion) if completion.success => (
                self.success_pair(),
                completion.callback_args(self.request.process_data),
            ),
            Some(completion) => (
                self.error_pair(),
                completion.callback_args(self.request.process_data),
            ),
            None => (
                self.error_pair(),
                Completion::failure(None, CLIENT_FAILURE_STATUS)
                    .callback_args(self.request.process_data),
            ),
        }
    }
}

/// Counters exposed through runtime stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub in_flight: usize,
    pub dispatched: usize,
    pub rejected: usize,
}

pub(crate) struct AsyncRequestBridge {
    transport: Arc<dyn Transport>,
    sender: LoopSender<RuntimeCommand>,
    pool_size: Option<usize>,
    pool: OnceCell<tokio::runtime::Runtime>,
    next_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    dispatched: AtomicUsize,
    rejected: AtomicUsize,
}

impl AsyncRequestBridge {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        sender: LoopSender<RuntimeCommand>,
        pool_size: Option<usize>,
    ) -> Self {
        Self {
            transport,
            sender,
            pool_size,
            pool: OnceCell::new(),
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            dispatched: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Start a request. `None` means nothing was scheduled at all.
    pub(crate) fn issue(
        &self,
        request: RequestSpec,
        on_success: CallbackHandle,
        on_error: CallbackHandle,
        receiver: ReceiverHandle,
    ) -> Option<RequestId> {
        if self.sender.is_closed() {
            return None;
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let prepared = request.prepare();
        let mut record = AsyncCallRecord {
            id,
            request,
            on_success,
            on_error,
            receiver,
            completion: None,
        };

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                log::warn!("request {id} rejected: {err}");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                record.completion = Some(Completion::failure(None, CLIENT_FAILURE_STATUS));
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                if !self.sender.post(RuntimeCommand::RequestDone(Box::new(record))) {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    return None;
                }
                return Some(id);
            }
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let transport = self.transport.clone();
        let sender = self.sender.clone();
        let in_flight = self.in_flight.clone();
        let job = move || {
            log::debug!("executing request {id}: {} {}", prepared.method, prepared.url);
            let completion = contain("request transport", || transport.execute(&prepared))
                .unwrap_or_else(|| Completion::failure(None, CLIENT_FAILURE_STATUS));
            record.completion = Some(completion);
            if !sender.post(RuntimeCommand::RequestDone(Box::new(record))) {
                log::warn!("request {id} completed after shutdown; result dropped");
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        };

        match self.dispatch(id, job) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                Some(id)
            }
            Err(err) => {
                log::error!("could not dispatch request {id}: {err}");
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    fn dispatch(&self, id: RequestId, job: impl FnOnce() + Send + 'static) -> Result<()> {
        match self.pool_size {
            Some(threads) => {
                let pool = self.pool.get_or_try_init(|| {
                    tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(threads)
                        .max_blocking_threads(threads)
                        .thread_name("jsloop-request-pool")
                        .build()
                        .map_err(RuntimeError::Spawn)
                })?;
                pool.spawn_blocking(job);
                Ok(())
            }
            None => {
                std::thread::Builder::new()
                    .name(format!("jsloop-request-{id}"))
                    .spawn(job)
                    .map_err(RuntimeError::Spawn)?;
                Ok(())
            }
        }
    }

    /// Mark one completion as consumed by the run loop.
    pub(crate) fn delivered(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn stats(&self) -> BridgeStats {
        BridgeStats {
            in_flight: self.in_flight.load(Ordering::Acquire),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AsyncRequestBridge {
    fn drop(&mut self) {
        // The bridge may be dropped from inside the run loop's tokio context,
        // where a blocking runtime shutdown would panic.
        if let Some(pool) = self.pool.take() {
            pool.shutdown_background();
        }
    }
}
