use std::sync::Arc;

use reliefsync_core::{OperationId, Table};
use reliefsync_engine::{EngineError, Migrator, SyncAdapter};
use reliefsync_storage::{LegacySnapshot, MemoryLegacyStore, RemoteError, SqliteRemoteStore};

use crate::LatencyRemote;

pub type TestRemote = Arc<LatencyRemote<SqliteRemoteStore>>;
pub type TestAdapter = SyncAdapter<TestRemote>;

/// One in-memory remote store and legacy store shared by any number of
/// clients.
pub struct TestBackend {
    pub remote: TestRemote,
    pub legacy: Arc<MemoryLegacyStore>,
}

impl TestBackend {
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_legacy(LegacySnapshot::default())
    }

    pub fn with_legacy(snapshot: LegacySnapshot) -> Result<Self, RemoteError> {
        Ok(Self {
            remote: Arc::new(LatencyRemote::new(SqliteRemoteStore::open_in_memory()?)),
            legacy: Arc::new(MemoryLegacyStore::new(snapshot)),
        })
    }

    /// The store behind the latency wrapper. Writes made here are never held.
    pub fn store(&self) -> &SqliteRemoteStore {
        self.remote.inner()
    }

    pub fn count(&self, table: Table) -> Result<usize, RemoteError> {
        self.store().count(table)
    }

    pub fn migrator(&self) -> Migrator<TestRemote, Arc<MemoryLegacyStore>> {
        Migrator::new(Arc::clone(&self.remote), Arc::clone(&self.legacy))
    }

    /// An adapter that has not loaded anything yet.
    pub fn adapter(&self, label: &str) -> TestAdapter {
        SyncAdapter::new(Arc::clone(&self.remote), label)
    }

    /// An initialized adapter, scoped to `operation` when given.
    pub async fn client(
        &self,
        label: &str,
        operation: Option<OperationId>,
    ) -> Result<TestAdapter, EngineError> {
        let adapter = self.adapter(label);
        adapter.initialize().await?;
        if let Some(operation) = operation {
            adapter.set_current_operation(operation).await?;
        }
        Ok(adapter)
    }
}
