//! Durable state storage for consensus decisions.
//!
//! A consensus participant must not acknowledge a decision before the state
//! backing it is on stable storage. Writes therefore hand back a
//! [`FlushSignal`] that resolves only once the write is durable. Backends are
//! free to batch: every write to the same id before the next flush shares one
//! signal, and a single flush resolves all of them together.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{FutureExt, channel::oneshot, future::Shared};
use tracing::trace;

use crate::error::StoreError;

/// Key of one unit of persisted state.
pub type DataId = String;

/// Completion handle for a write or a flush.
///
/// Clones resolve together. Awaiting it yields `Ok(())` once the write is
/// durable, or [`StoreError::Abandoned`] if the store went away first.
#[derive(Clone)]
pub struct FlushSignal {
    inner: Shared<oneshot::Receiver<()>>,
}

impl FlushSignal {
    fn pending() -> (oneshot::Sender<()>, Self) {
        let (resolve, rx) = oneshot::channel();
        (resolve, Self { inner: rx.shared() })
    }

    /// A signal that has already resolved successfully.
    pub fn resolved() -> Self {
        let (resolve, signal) = Self::pending();
        let _ = resolve.send(());
        signal
    }

    /// Checks without waiting whether the signal has resolved (either way).
    pub fn is_resolved(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }
}

impl Future for FlushSignal {
    type Output = Result<(), StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|outcome| outcome.map_err(|_| StoreError::Abandoned))
    }
}

/// Keyed state whose writes become durable asynchronously.
///
/// A store is owned by one consensus instance and used from one task.
pub trait DurableStateStore<V> {
    /// Replaces the state of `data_id`; `None` is the tombstone and deletes
    /// it. The new value (or the deletion) is readable immediately. The
    /// returned signal resolves once it is durable.
    fn set_state(&mut self, data_id: impl Into<DataId>, new_state: Option<V>) -> FlushSignal;

    /// Last value written for `data_id`, durable or not.
    fn get_state(&self, data_id: &str) -> Result<&V, StoreError>;

    /// Makes every write so far durable, resolving their signals. The
    /// returned signal resolves once that has happened.
    fn flush(&mut self) -> FlushSignal;
}

/// Reference store that keeps everything in memory.
///
/// With auto-flush on (the default) every write is treated as durable the
/// moment it is made, which suits tests that take storage correctness for
/// granted. With auto-flush off, signals stay pending until [`flush`].
///
/// [`flush`]: DurableStateStore::flush
pub struct MemoryOnlyStateStore<V> {
    data: HashMap<DataId, V>,
    pending: HashMap<DataId, PendingFlush>,
    auto_flush: bool,
}

struct PendingFlush {
    resolve: oneshot::Sender<()>,
    signal: FlushSignal,
}

impl PendingFlush {
    fn new() -> Self {
        let (resolve, signal) = FlushSignal::pending();
        Self { resolve, signal }
    }

    fn resolve(self) {
        // Nobody may be waiting any more; that is fine.
        let _ = self.resolve.send(());
    }
}

impl<V> Default for MemoryOnlyStateStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryOnlyStateStore<V> {
    pub fn new() -> Self {
        Self::with_auto_flush(true)
    }

    pub fn with_auto_flush(auto_flush: bool) -> Self {
        Self {
            data: HashMap::new(),
            pending: HashMap::new(),
            auto_flush,
        }
    }

    pub fn auto_flush(&self) -> bool {
        self.auto_flush
    }

    /// Turning auto-flush on does not resolve writes already pending.
    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }

    /// Number of ids with writes waiting for a flush.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<V> DurableStateStore<V> for MemoryOnlyStateStore<V> {
    fn set_state(&mut self, data_id: impl Into<DataId>, new_state: Option<V>) -> FlushSignal {
        let data_id = data_id.into();
        match new_state {
            Some(value) => {
                self.data.insert(data_id.clone(), value);
            }
            None => {
                self.data.remove(&data_id);
            }
        }

        if self.auto_flush {
            // Anything still pending from before auto-flush was enabled is
            // covered by this write, so its waiters resolve too.
            let signal = match self.pending.remove(&data_id) {
                Some(pending) => {
                    let signal = pending.signal.clone();
                    pending.resolve();
                    signal
                }
                None => FlushSignal::resolved(),
            };
            trace!(data_id = %data_id, "write durable immediately");
            return signal;
        }

        let signal = self
            .pending
            .entry(data_id.clone())
            .or_insert_with(PendingFlush::new)
            .signal
            .clone();
        trace!(data_id = %data_id, pending = self.pending.len(), "write pending flush");
        signal
    }

    fn get_state(&self, data_id: &str) -> Result<&V, StoreError> {
        self.data
            .get(data_id)
            .ok_or_else(|| StoreError::NotFound(data_id.to_string()))
    }

    fn flush(&mut self) -> FlushSignal {
        let batch = std::mem::take(&mut self.pending);
        trace!(resolved = batch.len(), "flush");
        for pending in batch.into_values() {
            pending.resolve();
        }
        FlushSignal::resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_flush_resolves_on_write() {
        let mut store = MemoryOnlyStateStore::new();
        let signal = store.set_state("ballot", Some(3u64));

        assert!(signal.is_resolved());
        assert_eq!(signal.await, Ok(()));
        assert_eq!(store.get_state("ballot"), Ok(&3));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn writes_to_one_id_share_a_signal_until_flush() {
        let mut store = MemoryOnlyStateStore::with_auto_flush(false);
        let first = store.set_state("slot-1", Some("a"));
        let second = store.set_state("slot-1", Some("b"));
        let other = store.set_state("slot-2", Some("c"));

        assert_eq!(store.get_state("slot-1"), Ok(&"b"));
        assert_eq!(store.pending_count(), 2);
        assert!(!first.is_resolved());
        assert!(!second.is_resolved());
        assert!(!other.is_resolved());

        let flushed = store.flush();
        assert!(first.is_resolved() && second.is_resolved() && other.is_resolved());
        assert_eq!(flushed.await, Ok(()));
        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(store.pending_count(), 0);

        let next = store.set_state("slot-1", Some("d"));
        assert!(!next.is_resolved());
        store.flush();
        assert_eq!(next.await, Ok(()));
    }

    #[tokio::test]
    async fn tombstone_hides_value_before_flush() {
        let mut store = MemoryOnlyStateStore::with_auto_flush(false);
        store.set_state("lease", Some(1u8));
        store.flush();

        let deleted = store.set_state("lease", None);
        assert_eq!(store.get_state("lease"), Err(StoreError::NotFound("lease".into())));
        assert!(store.is_empty());
        assert!(!deleted.is_resolved());

        store.flush();
        assert_eq!(deleted.await, Ok(()));
    }

    #[tokio::test]
    async fn empty_flush_resolves() {
        let mut store = MemoryOnlyStateStore::<u8>::with_auto_flush(false);
        assert_eq!(store.flush().await, Ok(()));
        assert_eq!(store.get_state("missing"), Err(StoreError::NotFound("missing".into())));
    }

    #[tokio::test]
    async fn enabling_auto_flush_resolves_earlier_waiters_on_next_write() {
        let mut store = MemoryOnlyStateStore::with_auto_flush(false);
        let early = store.set_state("k", Some(1));
        store.set_auto_flush(true);
        assert!(!early.is_resolved());

        let late = store.set_state("k", Some(2));
        assert_eq!(late.await, Ok(()));
        assert_eq!(early.await, Ok(()));
    }

    #[tokio::test]
    async fn dropping_the_store_abandons_pending_writes() {
        let mut store = MemoryOnlyStateStore::with_auto_flush(false);
        let signal = store.set_state("k", Some(1));
        drop(store);
        assert_eq!(signal.await, Err(StoreError::Abandoned));
    }
}
