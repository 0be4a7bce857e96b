//! Control bus: run/stop signal fan-out.
//!
//! The bus routes `(block, kind)` signals from requesters (UI, coordinator) to
//! executors. It has no opinion on what `Run` or `Stop` mean.
//!
//! - Handlers for a key are kept in registration order and invoked in that
//!   order.
//! - `publish` never waits: each handler's future is spawned onto the current
//!   tokio runtime, so a slow handler cannot stall the bus or its siblings.
//! - A handler that errors or panics is logged and isolated.
//! - Publishing to a key with no handlers is a no-op.
//!
//! # Example
//!
//! ```ignore
//! let bus = ControlBus::new();
//! let sub = bus.subscribe_run("deploy", |signal| async move {
//!     run_script(&signal.block).await
//! });
//! bus.publish_run("deploy");
//! sub.unsubscribe();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;

use runbook_types::BlockId;

// ============================================================================
// Signals
// ============================================================================

/// What a signal asks of the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Run,
    /// Advisory: the executor decides how (and whether) to stop.
    Stop,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Run => "run",
            SignalKind::Stop => "stop",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to every handler registered for `(block, kind)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    pub block: BlockId,
    pub kind: SignalKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("no tokio runtime; {kind} signal for {block} dropped")]
    NoRuntime { block: BlockId, kind: SignalKind },
}

// ============================================================================
// Bus
// ============================================================================

type Handler = Arc<dyn Fn(Signal) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type Key = (BlockId, SignalKind);

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<HashMap<Key, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, key: &Key, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(key);
        }
        removed
    }
}

/// Per-engine signal router. Cheap to clone; clones share registrations.
#[derive(Clone, Default)]
pub struct ControlBus {
    inner: Arc<Inner>,
}

impl ControlBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `(block, kind)`.
    ///
    /// The returned handle removes this registration when
    /// [`unsubscribe`](Unsubscribe::unsubscribe) is called. Dropping the
    /// handle leaves the handler registered.
    pub fn subscribe<F, Fut>(&self, block: impl Into<BlockId>, kind: SignalKind, handler: F) -> Unsubscribe
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = (block.into(), kind);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |signal| handler(signal).boxed());

        tracing::trace!(block = %key.0, kind = %kind, id, "control handler registered");
        self.inner
            .handlers
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Registration { id, handler });

        Unsubscribe {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    pub fn subscribe_run<F, Fut>(&self, block: impl Into<BlockId>, handler: F) -> Unsubscribe
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(block, SignalKind::Run, handler)
    }

    pub fn subscribe_stop<F, Fut>(&self, block: impl Into<BlockId>, handler: F) -> Unsubscribe
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(block, SignalKind::Stop, handler)
    }

    /// Fan a signal out to every handler currently registered for the key.
    ///
    /// Returns the number of handlers dispatched. Outside a tokio runtime the
    /// signal is dropped with a warning; use [`try_publish`](Self::try_publish)
    /// to find out.
    pub fn publish(&self, block: impl Into<BlockId>, kind: SignalKind) -> usize {
        self.try_publish(block, kind).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "signal dropped");
            0
        })
    }

    /// Like [`publish`](Self::publish), but a signal that had handlers and
    /// could not be dispatched is an error.
    pub fn try_publish(&self, block: impl Into<BlockId>, kind: SignalKind) -> Result<usize, PublishError> {
        let block = block.into();
        let key = (block, kind);

        // Snapshot under the lock; handlers may (un)subscribe while running.
        let handlers: Vec<Handler> = match self.inner.handlers.lock().get(&key) {
            Some(list) => list.iter().map(|r| Arc::clone(&r.handler)).collect(),
            None => Vec::new(),
        };
        let (block, kind) = key;

        if handlers.is_empty() {
            tracing::debug!(block = %block, kind = %kind, "no control handlers registered");
            return Ok(0);
        }

        let Ok(runtime) = Handle::try_current() else {
            return Err(PublishError::NoRuntime { block, kind });
        };

        let mut dispatched = 0;
        for handler in handlers {
            let signal = Signal {
                block: block.clone(),
                kind,
            };
            let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(signal))) {
                Ok(future) => future,
                Err(_) => {
                    tracing::error!(block = %block, kind = %kind, "control handler panicked");
                    continue;
                }
            };

            let block = block.clone();
            runtime.spawn(async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(block = %block, kind = %kind, error = %e, "control handler failed");
                    }
                    Err(_) => {
                        tracing::error!(block = %block, kind = %kind, "control handler panicked");
                    }
                }
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    pub fn publish_run(&self, block: impl Into<BlockId>) -> usize {
        self.publish(block, SignalKind::Run)
    }

    pub fn publish_stop(&self, block: impl Into<BlockId>) -> usize {
        self.publish(block, SignalKind::Stop)
    }

    /// Number of handlers registered for `(block, kind)`.
    pub fn handler_count(&self, block: &str, kind: SignalKind) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&(BlockId::new(block), kind))
            .map_or(0, Vec::len)
    }

    /// Drop every registration. Outstanding [`Unsubscribe`] handles become
    /// no-ops.
    pub fn reset(&self) {
        let mut handlers = self.inner.handlers.lock();
        let count: usize = handlers.values().map(Vec::len).sum();
        handlers.clear();
        tracing::debug!(count, "control bus reset");
    }
}

impl std::fmt::Debug for ControlBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.inner.handlers.lock();
        f.debug_struct("ControlBus")
            .field("keys", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

// ============================================================================
// Unsubscribe
// ============================================================================

/// Handle returned by [`ControlBus::subscribe`].
pub struct Unsubscribe {
    inner: Weak<Inner>,
    key: Key,
    id: u64,
}

impl Unsubscribe {
    /// Remove the registration. Idempotent; returns whether anything was
    /// removed by this call.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.remove(&self.key, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("block", &self.key.0)
            .field("kind", &self.key.1)
            .field("id", &self.id)
            .finish()
    }
}
