//! Runtime loader: lazy, single-flight initialization of the embedded interpreter.
//!
//! The loader owns the one interpreter instance of the process. Any number of callers may ask
//! for it concurrently through [`RuntimeLoader::ensure_ready`]; while a load is in flight they
//! all wait on the same shared future, so the provider's load sequence runs once per episode.
//! A failed episode is remembered until the next caller asks again, which starts a new one.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};

use crate::{error::LoadError, execution::Capture};

pub mod python;

/// A loaded interpreter able to evaluate guest source.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Evaluate `source`, writing every output chunk into `capture`.
    ///
    /// Guest-level errors are reported by writing to the capture's stderr; an `Err` here means
    /// the interpreter itself is broken.
    async fn evaluate(&self, source: &str, capture: &Capture) -> anyhow::Result<()>;

    /// Ask a running evaluation to stop. Returns `false` when the runtime has no way to do so.
    fn interrupt(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}

/// Knows how to bring an interpreter up.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Arc<dyn Interpreter>, LoadError>;
}

/// Opaque reference to a loaded interpreter, tagged with the load episode that produced it.
#[derive(Clone)]
pub struct RuntimeHandle {
    episode: u64,
    interpreter: Arc<dyn Interpreter>,
}

impl RuntimeHandle {
    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle").field("episode", &self.episode).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

type LoadFuture = Shared<BoxFuture<'static, Result<RuntimeHandle, LoadError>>>;

enum Slot {
    Uninitialized,
    Loading { episode: u64, pending: LoadFuture },
    Ready(RuntimeHandle),
    Failed(LoadError),
}

impl Slot {
    fn phase(&self) -> RuntimePhase {
        match self {
            Slot::Uninitialized => RuntimePhase::Uninitialized,
            Slot::Loading { .. } => RuntimePhase::Loading,
            Slot::Ready(_) => RuntimePhase::Ready,
            Slot::Failed(_) => RuntimePhase::Failed,
        }
    }
}

pub struct RuntimeLoader {
    provider: Arc<dyn RuntimeProvider>,
    slot: Arc<Mutex<Slot>>,
    episodes: AtomicU64,
}

impl RuntimeLoader {
    pub fn new(provider: Arc<dyn RuntimeProvider>) -> Self {
        Self {
            provider,
            slot: Arc::new(Mutex::new(Slot::Uninitialized)),
            episodes: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> RuntimePhase {
        lock(&self.slot).phase()
    }

    pub fn last_error(&self) -> Option<LoadError> {
        match &*lock(&self.slot) {
            Slot::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// The current handle, without triggering a load.
    pub fn handle(&self) -> Option<RuntimeHandle> {
        match &*lock(&self.slot) {
            Slot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Return the ready runtime, loading it first if needed.
    ///
    /// Callers arriving while a load is in flight join it instead of starting another.
    /// After a failure the next call starts a fresh attempt.
    pub async fn ensure_ready(&self) -> Result<RuntimeHandle, LoadError> {
        let pending = {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::Loading { pending, .. } => pending.clone(),
                Slot::Uninitialized | Slot::Failed(_) => {
                    let episode = self.episodes.fetch_add(1, Ordering::Relaxed) + 1;
                    let pending = self.begin_load(episode);
                    *slot = Slot::Loading { episode, pending: pending.clone() };
                    pending
                }
            }
        };
        pending.await
    }

    // The load runs on its own task so it keeps going when every waiter gives up.
    fn begin_load(&self, episode: u64) -> LoadFuture {
        let provider = Arc::clone(&self.provider);
        let slot = Arc::downgrade(&self.slot);
        info!("Loading runtime '{}' (episode {})", provider.name(), episode);

        let task = tokio::spawn(async move {
            let outcome = match tokio::spawn(async move { provider.load().await }).await {
                Ok(Ok(interpreter)) => Ok(RuntimeHandle { episode, interpreter }),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(LoadError::Other(format!("runtime provider failed: {}", err))),
            };

            if let Some(state) = slot.upgrade() {
                let mut slot = lock(&state);
                // Only the episode that owns the slot may settle it.
                if matches!(&*slot, Slot::Loading { episode: current, .. } if *current == episode) {
                    *slot = match &outcome {
                        Ok(handle) => Slot::Ready(handle.clone()),
                        Err(err) => Slot::Failed(err.clone()),
                    };
                }
            }

            match &outcome {
                Ok(_) => info!("Runtime ready (episode {})", episode),
                Err(err) => warn!("Runtime load failed (episode {}): {}", episode, err),
            }
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|err| Err(LoadError::Other(format!("runtime load task failed: {}", err))))
        }
        .boxed()
        .shared()
    }

    /// Whether `handle` is still the ready runtime.
    pub fn is_current(&self, handle: &RuntimeHandle) -> bool {
        matches!(&*lock(&self.slot), Slot::Ready(current) if current.episode == handle.episode)
    }

    /// Drop `handle` if it is still the current runtime, so the next caller reloads.
    pub async fn invalidate(&self, handle: &RuntimeHandle) -> bool {
        let interpreter = {
            let mut slot = lock(&self.slot);
            let interpreter = match &*slot {
                Slot::Ready(current) if current.episode == handle.episode => {
                    Arc::clone(&current.interpreter)
                }
                _ => return false,
            };
            *slot = Slot::Uninitialized;
            interpreter
        };
        warn!("Invalidating runtime (episode {})", handle.episode);
        interpreter.shutdown().await;
        true
    }

    /// Tear down a ready runtime and return to the uninitialized phase.
    ///
    /// Loading and failed episodes are left alone.
    pub async fn shutdown(&self) -> bool {
        let handle = {
            let mut slot = lock(&self.slot);
            match std::mem::replace(&mut *slot, Slot::Uninitialized) {
                Slot::Ready(handle) => handle,
                other => {
                    *slot = other;
                    return false;
                }
            }
        };
        debug!("Shutting down runtime (episode {})", handle.episode);
        handle.interpreter.shutdown().await;
        true
    }
}

impl fmt::Debug for RuntimeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLoader")
            .field("provider", &self.provider.name())
            .field("phase", &self.phase())
            .finish()
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
