use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use reliefsync_core::{Filter, Row, RowId, Table};
use reliefsync_storage::{EventSink, RemoteError, RemoteStore, Subscription};

/// Remote store wrapper that can hold back write responses.
///
/// While held, writes still commit (and publish their change events) on the
/// inner store, but the caller does not see the response until `release`.
/// Reads and subscriptions are never held.
pub struct LatencyRemote<R> {
    inner: R,
    held: watch::Sender<bool>,
    waiting: AtomicUsize,
}

impl<R: RemoteStore> LatencyRemote<R> {
    pub fn new(inner: R) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            inner,
            held,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Number of responses currently held back.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Yield until at least `n` responses are held back.
    pub async fn until_waiting(&self, n: usize) {
        while self.waiting() < n {
            tokio::task::yield_now().await;
        }
    }

    async fn gate(&self) {
        let mut rx = self.held.subscribe();
        let held = *rx.borrow_and_update();
        if !held {
            return;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let _ = rx.wait_for(|held| !*held).await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for LatencyRemote<R> {
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError> {
        self.inner.read(table, filter).await
    }

    async fn write(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        let result = self.inner.write(table, row).await;
        self.gate().await;
        result
    }

    async fn update(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        let result = self.inner.update(table, row).await;
        self.gate().await;
        result
    }

    async fn delete(&self, table: Table, id: RowId) -> Result<bool, RemoteError> {
        let result = self.inner.delete(table, id).await;
        self.gate().await;
        result
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        sink: EventSink,
    ) -> Result<Subscription, RemoteError> {
        self.inner.subscribe(table, filter, sink).await
    }
}
