//! Cinedex Batched Loader
//!
//! Coalesces keyed lookups issued in the same scheduling tick into a single
//! bulk fetch:
//!
//! ```text
//!   load("1") ─┐
//!   load("3") ─┼──► Batch {1, 3, 2} ──► source.load_batch([1, 3, 2]) ──┐
//!   load("2") ─┘        (one tick)            (one call)               │
//!                                                                      ▼
//!   caller 1 ◄── Some(movie 1)    caller 3 ◄── None    caller 2 ◄── Some(movie 2)
//! ```
//!
//! ## Behaviour
//!
//! - `load` enqueues at call time. Nothing is scheduled until a returned
//!   future is first polled and finds its value missing; that poll spawns a
//!   dispatch task that yields once (plus an optional delay) before closing
//!   the batch. Every `load` made before the caller's first real suspension
//!   therefore lands in one batch, on any runtime flavor.
//! - Repeated keys inside one batch are fetched once and fanned out.
//! - Nothing is cached: the same key in a later tick is fetched again.
//! - A missing key resolves to `Ok(None)` and never fails its siblings.
//!
//! ## States
//!
//! `Empty → Accumulating → Dispatching → Empty`. A fresh batch starts
//! accumulating as soon as the previous one is closed, so `Accumulating` and
//! an in-flight dispatch can overlap.

mod batch;

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use batch::{Batch, Closed};

// ============================================================================
// Source Interface
// ============================================================================

/// Error type bulk sources report.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Bulk fetch behind a loader.
///
/// `load_batch` must return exactly one slot per key, in the same order as
/// `keys`; `None` marks a key that does not exist.
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + 'static;

    async fn load_batch(&self, keys: &[Self::Key]) -> Result<Vec<Option<Self::Value>>, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("batch source failed: {0}")]
    Source(String),
    #[error("batch source returned {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("batch was dropped before it resolved")]
    Dropped,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Dispatch as soon as a batch holds this many distinct keys.
    pub max_batch_size: usize,
    /// Extra wait after the end-of-tick yield before dispatching.
    pub delay: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            delay: Duration::ZERO,
        }
    }
}

/// Where the loader currently is in its batch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Empty,
    Accumulating,
    Dispatching,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// `load` calls, counting each key of `load_many`
    pub loads: u64,
    /// Calls made to the source
    pub batches: u64,
    /// Distinct keys handed to the source, summed over batches
    pub keys: u64,
}

// ============================================================================
// Loader
// ============================================================================

struct Inner<S: BatchSource> {
    source: S,
    config: LoaderConfig,
    batch: Mutex<Batch<S::Key, S::Value>>,
    in_flight: AtomicUsize,
    loads: AtomicU64,
    batches: AtomicU64,
    keys: AtomicU64,
}

/// Batching front for a [`BatchSource`]. Cheap to clone.
///
/// Awaiting a load (and `load_many`, `dispatch`) spawns onto the current
/// Tokio runtime and must happen within one.
pub struct Loader<S: BatchSource> {
    inner: Arc<Inner<S>>,
}

impl<S: BatchSource> Clone for Loader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: BatchSource> Loader<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, LoaderConfig::default())
    }

    pub fn with_config(source: S, mut config: LoaderConfig) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                batch: Mutex::new(Batch::new()),
                in_flight: AtomicUsize::new(0),
                loads: AtomicU64::new(0),
                batches: AtomicU64::new(0),
                keys: AtomicU64::new(0),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// Request one key. The returned future resolves once the batch this key
    /// joined has been fetched.
    pub fn load(&self, key: S::Key) -> LoadFuture<S> {
        let (tx, rx) = oneshot::channel();
        let (generation, full) = {
            let mut batch = self.inner.batch.lock();
            self.enqueue(&mut batch, key, tx)
        };
        self.run_full(full);
        self.future(rx, generation)
    }

    /// Request several keys at once. All of them join the current batch
    /// (split only by `max_batch_size`); results come back in input order.
    pub async fn load_many<I>(&self, keys: I) -> Result<Vec<Option<S::Value>>, LoadError>
    where
        I: IntoIterator<Item = S::Key>,
    {
        let mut futures = Vec::new();
        let mut full = Vec::new();
        {
            let mut batch = self.inner.batch.lock();
            for key in keys {
                let (tx, rx) = oneshot::channel();
                let (generation, closed) = self.enqueue(&mut batch, key, tx);
                full.extend(closed);
                futures.push(self.future(rx, generation));
            }
        }
        for closed in full {
            self.run_full(Some(closed));
        }

        let mut out = Vec::with_capacity(futures.len());
        for fut in futures {
            out.push(fut.await?);
        }
        Ok(out)
    }

    /// Close the current batch now instead of waiting for the end of the
    /// tick. No-op when nothing is pending.
    pub async fn dispatch(&self) {
        let closed = {
            let mut batch = self.inner.batch.lock();
            if batch.is_empty() {
                return;
            }
            batch.take()
        };
        run(Arc::clone(&self.inner), closed).await;
    }

    pub fn state(&self) -> LoaderState {
        if !self.inner.batch.lock().is_empty() {
            LoaderState::Accumulating
        } else if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            LoaderState::Dispatching
        } else {
            LoaderState::Empty
        }
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            loads: self.inner.loads.load(Ordering::Relaxed),
            batches: self.inner.batches.load(Ordering::Relaxed),
            keys: self.inner.keys.load(Ordering::Relaxed),
        }
    }

    /// Add `key` to the open batch. Returns the generation it joined, and the
    /// batch itself when this key filled it.
    fn enqueue(
        &self,
        batch: &mut Batch<S::Key, S::Value>,
        key: S::Key,
        slot: batch::Slot<S::Value>,
    ) -> (u64, Option<Closed<S::Key, S::Value>>) {
        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = ?key, "enqueue load");
        let generation = batch.generation;
        batch.push(key, slot);

        if batch.len() >= self.inner.config.max_batch_size {
            return (generation, Some(batch.take()));
        }
        (generation, None)
    }

    fn run_full(&self, closed: Option<Closed<S::Key, S::Value>>) {
        if let Some(closed) = closed {
            tokio::spawn(run(Arc::clone(&self.inner), closed));
        }
    }

    fn future(
        &self,
        rx: oneshot::Receiver<Result<Option<S::Value>, LoadError>>,
        generation: u64,
    ) -> LoadFuture<S> {
        LoadFuture {
            rx,
            inner: Arc::clone(&self.inner),
            generation,
            armed: false,
        }
    }
}

/// Spawn the end-of-tick dispatch for `generation`, unless that batch is
/// already closed or already has one.
fn schedule<S: BatchSource>(inner: &Arc<Inner<S>>, generation: u64) {
    {
        let mut batch = inner.batch.lock();
        if batch.generation != generation || batch.scheduled || batch.is_empty() {
            return;
        }
        batch.scheduled = true;
    }
    tokio::spawn(dispatch_after_tick(Arc::clone(inner), generation));
}

/// Let every other ready task enqueue, then close the batch if it is still
/// the one this task was scheduled for.
async fn dispatch_after_tick<S: BatchSource>(inner: Arc<Inner<S>>, generation: u64) {
    tokio::task::yield_now().await;
    if !inner.config.delay.is_zero() {
        tokio::time::sleep(inner.config.delay).await;
    }

    let closed = {
        let mut batch = inner.batch.lock();
        if batch.generation != generation || batch.is_empty() {
            return;
        }
        batch.take()
    };
    run(inner, closed).await;
}

async fn run<S: BatchSource>(inner: Arc<Inner<S>>, closed: Closed<S::Key, S::Value>) {
    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    inner.batches.fetch_add(1, Ordering::Relaxed);
    inner
        .keys
        .fetch_add(closed.keys.len() as u64, Ordering::Relaxed);

    let expected = closed.keys.len();
    tracing::debug!(keys = ?closed.keys, "dispatching batch");

    match inner.source.load_batch(&closed.keys).await {
        Ok(values) if values.len() == expected => {
            let found = values.iter().filter(|v| v.is_some()).count();
            tracing::debug!(requested = expected, found, "batch resolved");
            closed.resolve(values);
        }
        Ok(values) => {
            tracing::warn!(expected, actual = values.len(), "batch source returned wrong length");
            closed.fail(LoadError::LengthMismatch {
                expected,
                actual: values.len(),
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "batch source failed");
            closed.fail(LoadError::Source(e.to_string()));
        }
    }

    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
}

// ============================================================================
// Load Future
// ============================================================================

/// Pending result of [`Loader::load`].
///
/// The first poll that finds no value yet schedules the dispatch of the batch
/// this key joined.
#[must_use = "the value is only delivered if the future is awaited"]
pub struct LoadFuture<S: BatchSource> {
    rx: oneshot::Receiver<Result<Option<S::Value>, LoadError>>,
    inner: Arc<Inner<S>>,
    generation: u64,
    armed: bool,
}

impl<S: BatchSource> Future for LoadFuture<S> {
    type Output = Result<Option<S::Value>, LoadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LoadError::Dropped)),
            Poll::Pending => {
                if !this.armed {
                    this.armed = true;
                    schedule(&this.inner, this.generation);
                }
                Poll::Pending
            }
        }
    }
}
