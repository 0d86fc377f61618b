//! Execution engine: request/result types and the single-flight execution manager.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{ErrorKind, ExecutionError, LoadError},
    runtime::{RuntimeHandle, RuntimeLoader},
};

mod capture;

pub use capture::{Capture, Captured, ChunkSink, OutputSinks};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    /// Set on failure, and on success when stderr output was let through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    fn completed(output: String) -> Self {
        Self { success: true, output, error: None }
    }

    fn failed(output: String, error: ExecutionError) -> Self {
        Self { success: false, output, error: Some(error) }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub source: String,
    pub sinks: OutputSinks,
    /// Falls back to the manager's default when unset.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), sinks: OutputSinks::default(), timeout: None }
    }

    pub fn with_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a completed evaluation's stderr means for the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrPolicy {
    /// Any stderr output fails the call with `InterpreterError`.
    #[default]
    Fail,
    /// stderr does not affect success; it is still reported as an `InterpreterError`.
    Ignore,
}

impl std::str::FromStr for StderrPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(StderrPolicy::Fail),
            "ignore" => Ok(StderrPolicy::Ignore),
            other => anyhow::bail!("unknown stderr policy '{}'", other),
        }
    }
}

/// Per-call lifecycle, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initializing,
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

pub struct ExecutionManager {
    loader: Arc<RuntimeLoader>,
    runtime_lock: tokio::sync::Mutex<()>,
    default_timeout: Duration,
    load_timeout: Option<Duration>,
    stderr_policy: StderrPolicy,
    calls: AtomicU64,
}

impl ExecutionManager {
    pub fn new(loader: Arc<RuntimeLoader>) -> Self {
        Self {
            loader,
            runtime_lock: tokio::sync::Mutex::new(()),
            default_timeout: DEFAULT_TIMEOUT,
            load_timeout: None,
            stderr_policy: StderrPolicy::default(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn from_config(loader: Arc<RuntimeLoader>, cfg: &Config) -> Self {
        let stderr_policy = cfg
            .get("CODEBOX_STDERR_POLICY")
            .and_then(|v| match v.parse::<StderrPolicy>() {
                Ok(policy) => Some(policy),
                Err(err) => {
                    warn!("{}; using default", err);
                    None
                }
            })
            .unwrap_or_default();

        Self::new(loader)
            .with_default_timeout(cfg.get_secs("CODEBOX_TIMEOUT").unwrap_or(DEFAULT_TIMEOUT))
            .with_load_timeout(cfg.get_secs("CODEBOX_LOAD_TIMEOUT"))
            .with_stderr_policy(stderr_policy)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Bound how long a call waits for the runtime to become ready.
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    pub fn loader(&self) -> &Arc<RuntimeLoader> {
        &self.loader
    }

    pub async fn run_source(&self, source: &str) -> ExecutionResult {
        self.run(ExecutionRequest::new(source)).await
    }

    /// Evaluate one request against the shared runtime.
    ///
    /// Calls run one at a time in arrival order. The timeout covers the evaluation itself,
    /// not the wait for the runtime or for earlier calls. On timeout the runtime is asked to
    /// interrupt the evaluation; one that cannot is reset, and the next call reloads it.
    /// Nothing written after the timeout reaches this call's result or sinks.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let ExecutionRequest { source, sinks, timeout } = request;
        let timeout = timeout.unwrap_or(self.default_timeout);

        transition(call, CallState::Initializing);
        let handle = match self.await_runtime().await {
            Ok(handle) => handle,
            Err(err) => {
                transition(call, CallState::Failed);
                warn!("call {}: runtime unavailable: {}", call, err);
                return ExecutionResult::failed(String::new(), err.into());
            }
        };

        transition(call, CallState::Queued);
        let _running = self.runtime_lock.lock().await;
        // An earlier call may have reset the runtime while this one was queued.
        let handle = if self.loader.is_current(&handle) {
            handle
        } else {
            match self.await_runtime().await {
                Ok(handle) => handle,
                Err(err) => {
                    transition(call, CallState::Failed);
                    warn!("call {}: runtime unavailable: {}", call, err);
                    return ExecutionResult::failed(String::new(), err.into());
                }
            }
        };
        transition(call, CallState::Running);

        let capture = Capture::new(sinks);
        let evaluation = AssertUnwindSafe(handle.interpreter().evaluate(&source, &capture)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            res = evaluation => Some(res),
            _ = tokio::time::sleep(timeout) => None,
        };
        let captured = capture.seal();

        match outcome {
            Some(Ok(Ok(()))) => self.finish(call, captured),
            Some(Ok(Err(err))) => {
                transition(call, CallState::Failed);
                warn!("call {}: interpreter fault: {:#}", call, err);
                self.loader.invalidate(&handle).await;
                ExecutionResult::failed(
                    captured.stdout,
                    ExecutionError::new(ErrorKind::InternalFault, format!("{:#}", err)),
                )
            }
            Some(Err(_)) => {
                transition(call, CallState::Failed);
                warn!("call {}: evaluation panicked", call);
                self.loader.invalidate(&handle).await;
                ExecutionResult::failed(
                    captured.stdout,
                    ExecutionError::new(ErrorKind::InternalFault, "evaluation panicked"),
                )
            }
            None => {
                transition(call, CallState::TimedOut);
                if !handle.interpreter().interrupt() {
                    debug!("call {}: runtime cannot be interrupted; resetting it", call);
                    self.loader.invalidate(&handle).await;
                }
                ExecutionResult::failed(
                    captured.stdout,
                    ExecutionError::new(
                        ErrorKind::ExecutionTimeout,
                        format!("execution exceeded {:?}", timeout),
                    ),
                )
            }
        }
    }

    fn finish(&self, call: u64, captured: Captured) -> ExecutionResult {
        if captured.stderr.is_empty() {
            transition(call, CallState::Completed);
            return ExecutionResult::completed(captured.stdout);
        }
        let error = ExecutionError::new(ErrorKind::InterpreterError, captured.stderr);
        match self.stderr_policy {
            StderrPolicy::Fail => {
                transition(call, CallState::Failed);
                ExecutionResult::failed(captured.stdout, error)
            }
            StderrPolicy::Ignore => {
                transition(call, CallState::Completed);
                ExecutionResult { success: true, output: captured.stdout, error: Some(error) }
            }
        }
    }

    async fn await_runtime(&self) -> Result<RuntimeHandle, LoadError> {
        match self.load_timeout {
            Some(limit) => tokio::time::timeout(limit, self.loader.ensure_ready())
                .await
                .map_err(|_| LoadError::Timeout(limit))?,
            None => self.loader.ensure_ready().await,
        }
    }
}

fn transition(call: u64, state: CallState) {
    match state {
        CallState::Completed | CallState::Failed | CallState::TimedOut => {
            info!("call {}: {:?}", call, state)
        }
        _ => debug!("call {}: {:?}", call, state),
    }
}
