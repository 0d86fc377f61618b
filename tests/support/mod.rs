//! Scripted in-memory runtime for exercising the loader and the manager.
//!
//! Source is a `;`-separated list of steps:
//! `out:TEXT`, `err:TEXT`, `sleep:MS`, `yield`, `fault`, `panic`, and `late:MS:TEXT`
//! (writes TEXT to stdout MS milliseconds later from a detached task, as a runtime that keeps
//! going after the caller stopped waiting would).
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use codebox::{
    execution::Capture,
    runtime::{Interpreter, RuntimeLoader, RuntimeProvider},
    ExecutionManager, LoadError,
};

#[derive(Debug, Default)]
pub struct Stats {
    pub loads: AtomicUsize,
    pub evaluations: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Stats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

pub struct ScriptedProvider {
    pub stats: Arc<Stats>,
    delay: Duration,
    failures: AtomicUsize,
    panics: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self { stats: Arc::default(), delay: Duration::ZERO, failures: AtomicUsize::new(0), panics: false }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` loads.
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }
}

#[async_trait]
impl RuntimeProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self) -> Result<Arc<dyn Interpreter>, LoadError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.panics {
            panic!("provider blew up");
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LoadError::Fetch {
                location: "https://cdn.invalid/runtime".into(),
                message: "connection refused".into(),
            });
        }
        Ok(Arc::new(ScriptedInterpreter { stats: Arc::clone(&self.stats) }))
    }
}

pub struct ScriptedInterpreter {
    stats: Arc<Stats>,
}

struct InFlight<'a>(&'a Stats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a Stats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn evaluate(&self, source: &str, capture: &Capture) -> Result<()> {
        self.stats.evaluations.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.stats);

        for step in source.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (op, arg) = step.split_once(':').unwrap_or((step, ""));
            match op {
                "out" => capture.stdout(arg),
                "err" => capture.stderr(arg),
                "sleep" => tokio::time::sleep(Duration::from_millis(arg.parse()?)).await,
                "yield" => tokio::task::yield_now().await,
                "fault" => bail!("kernel exited"),
                "panic" => panic!("interpreter blew up"),
                "late" => {
                    let (ms, text) = arg.split_once(':').unwrap_or((arg, ""));
                    let delay = Duration::from_millis(ms.parse()?);
                    let capture = capture.clone();
                    let text = text.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        capture.stdout(&text);
                    });
                }
                other => bail!("unknown step '{}'", other),
            }
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
        false
    }

    async fn shutdown(&self) {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn loader(provider: ScriptedProvider) -> (Arc<RuntimeLoader>, Arc<Stats>) {
    let stats = Arc::clone(&provider.stats);
    (Arc::new(RuntimeLoader::new(Arc::new(provider))), stats)
}

pub fn manager(provider: ScriptedProvider) -> (Arc<ExecutionManager>, Arc<Stats>) {
    let (loader, stats) = loader(provider);
    (Arc::new(ExecutionManager::new(loader)), stats)
}
