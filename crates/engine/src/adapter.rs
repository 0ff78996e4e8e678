use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tracing::{debug, info, warn};

use reliefsync_core::{
    ClientId, Facility, FacilityDraft, FacilityId, FacilityPatch, Filter, Operation,
    OperationDraft, OperationId, Record, RowId, Table, WriteStamp,
};
use reliefsync_storage::{
    Delivery, ErrorKind, EventSink, RemoteError, RemoteStore, StreamKey, SubscriptionId,
};

use crate::EngineError;
use crate::mirror::Mirror;
use crate::reconciler::{ReconcileOutcome, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Default)]
struct Streams {
    operations: Option<SubscriptionId>,
    facilities: Option<SubscriptionId>,
}

/// Mirror plus write-through mutators over a remote store.
///
/// Every mutator calls the gateway first and touches the mirror only after
/// the call succeeded. Change events are folded in by
/// [`process_pending_events`](Self::process_pending_events) or
/// [`next_event`](Self::next_event).
pub struct SyncAdapter<R> {
    remote: R,
    label: String,
    mirror: Mutex<Mirror>,
    reconciler: Reconciler,
    sink: EventSink,
    inbox: TokioMutex<mpsc::UnboundedReceiver<Delivery>>,
    streams: TokioMutex<Streams>,
    connection: watch::Sender<ConnectionState>,
}

impl<R: RemoteStore> SyncAdapter<R> {
    pub fn new(remote: R, label: impl Into<String>) -> Self {
        let (sink, inbox) = mpsc::unbounded_channel();
        let (connection, _) = watch::channel(ConnectionState::Connected);
        Self {
            remote,
            label: label.into(),
            mirror: Mutex::new(Mirror::new()),
            reconciler: Reconciler::new(ClientId::new()),
            sink,
            inbox: TokioMutex::new(inbox),
            streams: TokioMutex::new(Streams::default()),
            connection,
        }
    }

    pub fn origin(&self) -> ClientId {
        self.reconciler.origin()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    // ========================================================================
    // Connection state
    // ========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn set_connection(&self, state: ConnectionState) {
        let changed = self.connection.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            match state {
                ConnectionState::Connected => info!(client = %self.label, "remote store reachable"),
                ConnectionState::Disconnected => warn!(client = %self.label, "remote store unreachable"),
            }
        }
    }

    /// Record the connection outcome of a gateway call.
    fn observe<T>(&self, result: Result<T, RemoteError>) -> Result<T, EngineError> {
        match result {
            Ok(value) => {
                self.set_connection(ConnectionState::Connected);
                Ok(value)
            }
            Err(e) => Err(self.failed(e)),
        }
    }

    fn failed(&self, e: RemoteError) -> EngineError {
        if e.kind() == ErrorKind::Connection {
            self.set_connection(ConnectionState::Disconnected);
        }
        e.into()
    }

    fn stamp(&self, revision: u64) -> Option<WriteStamp> {
        Some(WriteStamp {
            origin: self.origin(),
            revision,
        })
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn current_operation(&self) -> Option<OperationId> {
        self.mirror.lock().current_operation()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.mirror.lock().operations()
    }

    pub fn facilities(&self) -> Vec<Facility> {
        self.mirror.lock().facilities()
    }

    pub fn facility(&self, id: FacilityId) -> Option<Facility> {
        self.mirror.lock().facility(id)
    }

    pub fn active_streams(&self) -> Vec<StreamKey> {
        self.reconciler.active_streams()
    }

    // ========================================================================
    // Stream setup
    // ========================================================================

    async fn open_stream(&self, table: Table, filter: Filter) -> Result<SubscriptionId, EngineError> {
        let subscription = self
            .observe(self.remote.subscribe(table, filter, self.sink.clone()).await)?;
        debug!(client = %self.label, stream = %subscription.key(), "stream opened");
        Ok(self.reconciler.track(subscription))
    }

    /// Load every operation and start watching the operations table.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let mut streams = self.streams.lock().await;
        let stream = self.open_stream(Table::Operations, Filter::all()).await?;
        let rows = match self.remote.read(Table::Operations, &Filter::all()).await {
            Ok(rows) => rows,
            Err(e) => {
                self.reconciler.release(stream);
                return Err(self.failed(e));
            }
        };
        let count = rows.len();
        self.mirror.lock().load_operations(rows)?;
        if let Some(old) = streams.operations.replace(stream) {
            self.reconciler.release(old);
        }
        info!(client = %self.label, operations = count, "adapter initialized");
        Ok(())
    }

    /// Make `operation` current: its facilities replace whatever the mirror
    /// held, and the facilities stream is re-keyed to it.
    pub async fn set_current_operation(&self, operation: OperationId) -> Result<(), EngineError> {
        let mut streams = self.streams.lock().await;

        let known = self.mirror.lock().operation(operation).is_some();
        if !known {
            let found = self
                .observe(
                    self.remote
                        .read(Table::Operations, &Filter::eq_ref("id", operation))
                        .await,
                )?;
            if found.is_empty() {
                return Err(EngineError::OperationNotFound(operation));
            }
        }

        let filter = Filter::eq_ref("operation_id", operation);
        let stream = self.open_stream(Table::Facilities, filter.clone()).await?;
        let rows = match self.remote.read(Table::Facilities, &filter).await {
            Ok(rows) => rows,
            Err(e) => {
                self.reconciler.release(stream);
                return Err(self.failed(e));
            }
        };

        let count = rows.len();
        self.mirror.lock().scope_facilities(operation, rows)?;
        if let Some(old) = streams.facilities.replace(stream) {
            self.reconciler.release(old);
        }
        info!(client = %self.label, %operation, facilities = count, "current operation set");
        Ok(())
    }

    /// Tear down every stream. Queued deliveries are dropped on arrival.
    pub async fn shutdown(&self) {
        let mut streams = self.streams.lock().await;
        *streams = Streams::default();
        self.reconciler.release_all();
        debug!(client = %self.label, "adapter shut down");
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    pub async fn create_operation(&self, name: &str) -> Result<Operation, EngineError> {
        let revision = self.mirror.lock().next_revision();
        let mut row = OperationDraft::named(name).to_row();
        row.meta.stamp = self.stamp(revision);

        let row = self.observe(self.remote.write(Table::Operations, row).await)?;
        let operation = Operation::from_row(&row)?;
        self.mirror.lock().confirm_operation(row, revision)?;
        info!(client = %self.label, operation = %operation.id, name = %operation.name, "operation created");
        Ok(operation)
    }

    /// Write a new facility under the draft's operation, or the current one.
    /// A facility created for any operation other than the current one is
    /// written and returned but stays out of the mirror.
    pub async fn create_facility(&self, draft: FacilityDraft) -> Result<Facility, EngineError> {
        let (operation, revision) = {
            let mut mirror = self.mirror.lock();
            let operation = draft
                .operation_id
                .or(mirror.current_operation())
                .ok_or(EngineError::NoActiveOperation)?;
            (operation, mirror.next_revision())
        };
        let mut row = draft.to_row(operation);
        row.meta.stamp = self.stamp(revision);

        let row = self.observe(self.remote.write(Table::Facilities, row).await)?;
        let facility = Facility::from_row(&row)?;
        let kept = self.mirror.lock().confirm_facility(row, revision)?;
        if !kept {
            debug!(
                client = %self.label,
                facility = %facility.id,
                operation = %operation,
                "created outside the current operation"
            );
        }
        info!(client = %self.label, facility = %facility.id, name = %facility.name, "facility created");
        Ok(facility)
    }

    pub async fn update_facility(
        &self,
        id: FacilityId,
        patch: FacilityPatch,
    ) -> Result<Facility, EngineError> {
        let revision = {
            let mut mirror = self.mirror.lock();
            if mirror.facility_entry(id).is_none() {
                return Err(EngineError::FacilityNotFound(id));
            }
            mirror.next_revision()
        };
        let mut row = patch.to_row(id);
        row.meta.stamp = self.stamp(revision);

        let row = self.observe(self.remote.update(Table::Facilities, row).await)?;
        let facility = Facility::from_row(&row)?;
        let kept = self.mirror.lock().confirm_facility(row, revision)?;
        if !kept {
            debug!(client = %self.label, facility = %id, "update confirmed after removal");
        }
        Ok(facility)
    }

    pub async fn delete_facility(&self, id: FacilityId) -> Result<bool, EngineError> {
        if self.mirror.lock().facility(id).is_none() {
            return Err(EngineError::FacilityNotFound(id));
        }
        let deleted = self.observe(self.remote.delete(Table::Facilities, RowId::from(id)).await)?;
        self.mirror.lock().remove_facility(id);
        info!(client = %self.label, facility = %id, deleted, "facility deleted");
        Ok(deleted)
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    fn dispatch(&self, delivery: Delivery) -> ReconcileOutcome {
        let outcome = {
            let mut mirror = self.mirror.lock();
            self.reconciler.handle(&mut mirror, delivery)
        };
        if let ReconcileOutcome::StreamFailed { error, .. } = &outcome
            && error.kind == ErrorKind::Connection
        {
            self.set_connection(ConnectionState::Disconnected);
        }
        outcome
    }

    /// Fold every delivery that is already queued into the mirror without
    /// waiting. Returns nothing while another task is inside `next_event`.
    pub fn process_pending_events(&self) -> Vec<ReconcileOutcome> {
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return Vec::new();
        };
        let mut outcomes = Vec::new();
        while let Ok(delivery) = inbox.try_recv() {
            outcomes.push(self.dispatch(delivery));
        }
        outcomes
    }

    /// Wait for the next delivery and fold it into the mirror.
    pub async fn next_event(&self) -> Option<ReconcileOutcome> {
        let delivery = self.inbox.lock().await.recv().await?;
        Some(self.dispatch(delivery))
    }

    /// Endless stream of reconcile outcomes, driven by `next_event`.
    pub fn outcomes(&self) -> impl Stream<Item = ReconcileOutcome> + '_ {
        futures::stream::unfold(self, |adapter| async move {
            adapter.next_event().await.map(|outcome| (outcome, adapter))
        })
    }
}

impl<R> Drop for SyncAdapter<R> {
    fn drop(&mut self) {
        self.reconciler.release_all();
    }
}
