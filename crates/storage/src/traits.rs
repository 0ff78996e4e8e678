use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reliefsync_core::{Filter, Row, RowId, Table};
use tokio::sync::mpsc;

use crate::error::{RemoteError, StreamError};
use crate::subscription::{Subscription, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One committed change, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
    /// Commit sequence of the change; strictly increasing across the store.
    pub version: i64,
}

impl ChangeEvent {
    /// The row state the event leaves behind (or, for deletes, the removed row).
    pub fn row(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn row_id(&self) -> Option<RowId> {
        self.row().and_then(|r| r.id)
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub event: Result<ChangeEvent, StreamError>,
}

pub type EventSink = mpsc::UnboundedSender<Delivery>;

/// One logical change stream: a table plus its scoping filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub table: Table,
    pub filter: Filter,
}

impl StreamKey {
    pub fn new(table: Table, filter: Filter) -> Self {
        Self { table, filter }
    }

    pub fn unscoped(table: Table) -> Self {
        Self::new(table, Filter::all())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.filter)
    }
}

/// Typed request/response surface of the remote relational backend.
///
/// Implementations never retry; every failure is returned to the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError>;

    /// Upsert keyed by `row.id`; a row without an id gets a fresh one.
    async fn write(&self, table: Table, row: Row) -> Result<Row, RemoteError>;

    /// Like `write`, but fails with a validation error if the row is gone.
    async fn update(&self, table: Table, row: Row) -> Result<Row, RemoteError>;

    async fn delete(&self, table: Table, id: RowId) -> Result<bool, RemoteError>;

    /// Deliver every matching change to `sink` until the returned handle is
    /// unsubscribed or dropped.
    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        sink: EventSink,
    ) -> Result<Subscription, RemoteError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError> {
        (**self).read(table, filter).await
    }

    async fn write(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        (**self).write(table, row).await
    }

    async fn update(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        (**self).update(table, row).await
    }

    async fn delete(&self, table: Table, id: RowId) -> Result<bool, RemoteError> {
        (**self).delete(table, id).await
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        sink: EventSink,
    ) -> Result<Subscription, RemoteError> {
        (**self).subscribe(table, filter, sink).await
    }
}
