//! Exactly-once asynchronous engine initialization.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;

use super::EngineKind;
use crate::error::InitError;

type InitFuture<T> = Shared<BoxFuture<'static, Result<Arc<T>, InitError>>>;

enum Slot<T: ?Sized> {
    Uninitialized,
    /// The in-flight attempt. Later callers clone and await the same future.
    Initializing {
        attempt: u64,
        future: InitFuture<T>,
    },
    Ready(Arc<T>),
    Failed(InitError),
}

/// Snapshot of a loader's state.
pub enum InitializationState<T: ?Sized> {
    Uninitialized,
    Initializing,
    Ready(Arc<T>),
    Failed(String),
}

/// Serializable engine status for the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed { reason: String },
}

/// Lazily initializes one engine kind.
///
/// At most one attempt is ever in flight. Every caller that arrives while an
/// attempt runs awaits that same attempt and sees its outcome. Success is
/// cached for the lifetime of the loader; failure is recorded and the next
/// call starts a fresh attempt.
pub struct EngineLoader<T: ?Sized> {
    kind: EngineKind,
    slot: Arc<Mutex<Slot<T>>>,
    attempts: AtomicU64,
}

impl<T: ?Sized + Send + Sync + 'static> EngineLoader<T> {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            slot: Arc::new(Mutex::new(Slot::Uninitialized)),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Number of initialization attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Return the engine, initializing it with `init` if nobody has yet.
    ///
    /// `init` is only invoked when a new attempt starts. The attempt runs on
    /// its own task, so it completes even if every caller stops waiting.
    pub async fn ensure_ready<F, Fut>(&self, init: F) -> Result<Arc<T>, InitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let future = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match &*slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::Initializing { future, .. } => future.clone(),
                Slot::Uninitialized | Slot::Failed(_) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = self.start(attempt, init());
                    *slot = Slot::Initializing {
                        attempt,
                        future: future.clone(),
                    };
                    future
                }
            }
        };

        future.await
    }

    fn start<Fut>(&self, attempt: u64, load: Fut) -> InitFuture<T>
    where
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let kind = self.kind;
        let slot = self.slot.clone();

        let task = tokio::spawn({
            let slot = slot.clone();
            async move {
                tracing::info!(engine = %kind, attempt, "Initializing engine");
                let start = Instant::now();

                let outcome = load
                    .await
                    .map_err(|e| InitError::new(kind, format!("{:#}", e)));

                match &outcome {
                    Ok(_) => tracing::info!(
                        engine = %kind,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Engine ready"
                    ),
                    Err(e) => tracing::error!(
                        engine = %kind,
                        attempt,
                        error = %e.reason,
                        "Engine initialization failed"
                    ),
                }

                settle(&slot, attempt, &outcome);
                outcome
            }
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The attempt panicked or was aborted; record it so a retry is possible
                    let outcome = Err(InitError::new(
                        kind,
                        format!("initialization task failed: {}", e),
                    ));
                    settle(&slot, attempt, &outcome);
                    outcome
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Current state without triggering initialization.
    pub fn state(&self) -> InitializationState<T> {
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Uninitialized => InitializationState::Uninitialized,
            Slot::Initializing { .. } => InitializationState::Initializing,
            Slot::Ready(handle) => InitializationState::Ready(handle.clone()),
            Slot::Failed(e) => InitializationState::Failed(e.reason.clone()),
        }
    }

    pub fn status(&self) -> EngineStatus {
        match self.state() {
            InitializationState::Uninitialized => EngineStatus::Uninitialized,
            InitializationState::Initializing => EngineStatus::Initializing,
            InitializationState::Ready(_) => EngineStatus::Ready,
            InitializationState::Failed(reason) => EngineStatus::Failed { reason },
        }
    }

    /// The engine, if it is already initialized.
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Slot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }
}

/// Record the outcome of `attempt`, unless a different attempt owns the slot.
fn settle<T: ?Sized>(
    slot: &Mutex<Slot<T>>,
    attempt: u64,
    outcome: &Result<Arc<T>, InitError>,
) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let owns_slot = matches!(&*slot, Slot::Initializing { attempt: current, .. } if *current == attempt);
    if owns_slot {
        *slot = match outcome {
            Ok(handle) => Slot::Ready(handle.clone()),
            Err(e) => Slot::Failed(e.clone()),
        };
    }
}
