use std::collections::{BTreeMap, BTreeSet};

use reliefsync_core::{CoreError, Facility, FacilityId, Operation, OperationId, Record, Row, RowId};

/// Mirror copy of one remote row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub record: T,
    /// Last row state reflected into the mirror.
    pub row: Row,
    /// Revision of the newest local write confirmed or echoed for this row.
    pub local_revision: u64,
    /// Server version of `row`.
    pub version: i64,
}

impl<T: Record> CacheEntry<T> {
    pub fn from_row(row: Row, local_revision: u64) -> Result<Self, CoreError> {
        let record = T::from_row(&row)?;
        Ok(Self {
            record,
            version: row.meta.version,
            row,
            local_revision,
        })
    }

    /// Replace the reflected row, keeping the local revision.
    pub fn reflect(&mut self, row: Row) -> Result<(), CoreError> {
        self.record = T::from_row(&row)?;
        self.version = row.meta.version;
        self.row = row;
        Ok(())
    }
}

/// Entries of one mirrored table, keyed by row id.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    entries: BTreeMap<RowId, CacheEntry<T>>,
    /// Ids deleted since the last full read. Nothing re-creates them.
    tombstones: BTreeSet<RowId>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<T: Record + Clone> Collection<T> {
    pub fn get(&self, id: RowId) -> Option<&CacheEntry<T>> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: RowId) -> Option<&mut CacheEntry<T>> {
        self.entries.get_mut(&id)
    }

    pub fn insert(&mut self, entry: CacheEntry<T>) {
        let id: RowId = entry.record.id().into();
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: RowId) -> Option<CacheEntry<T>> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> Vec<T> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }

    /// Drop an entry and refuse it from now on.
    pub fn tombstone(&mut self, id: RowId) -> Option<CacheEntry<T>> {
        self.tombstones.insert(id);
        self.entries.remove(&id)
    }

    pub fn is_tombstoned(&self, id: RowId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Swap the whole collection for a fresh read. The read already leaves
    /// out deleted rows, so earlier tombstones are forgotten.
    pub fn load(&mut self, rows: Vec<Row>) -> Result<(), CoreError> {
        let mut entries = BTreeMap::new();
        for row in rows {
            let id = row.require_id()?;
            let local_revision = self.entries.get(&id).map_or(0, |e| e.local_revision);
            entries.insert(id, CacheEntry::from_row(row, local_revision)?);
        }
        self.entries = entries;
        self.tombstones.clear();
        Ok(())
    }

    /// Reflect the gateway's answer to a local write made at `revision`. A row
    /// the mirror already holds at a newer version is left alone.
    fn confirm(&mut self, row: Row, revision: u64) -> Result<(), CoreError> {
        let id = row.require_id()?;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if row.meta.version > entry.version {
                    entry.reflect(row)?;
                }
                entry.local_revision = entry.local_revision.max(revision);
            }
            None => {
                self.entries.insert(id, CacheEntry::from_row(row, revision)?);
            }
        }
        Ok(())
    }
}

/// Client-side cache of operations and of the facilities of the current
/// operation. Owned by one adapter; never shared across clients.
#[derive(Debug, Default)]
pub struct Mirror {
    pub(crate) operations: Collection<Operation>,
    pub(crate) facilities: Collection<Facility>,
    pub(crate) current_operation: Option<OperationId>,
    revision: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn current_operation(&self) -> Option<OperationId> {
        self.current_operation
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations.records()
    }

    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        self.operations.get(id.into()).map(|e| e.record.clone())
    }

    pub fn facilities(&self) -> Vec<Facility> {
        self.facilities.records()
    }

    pub fn facility(&self, id: FacilityId) -> Option<Facility> {
        self.facilities.get(id.into()).map(|e| e.record.clone())
    }

    pub fn facility_entry(&self, id: FacilityId) -> Option<&CacheEntry<Facility>> {
        self.facilities.get(id.into())
    }

    pub fn is_tombstoned(&self, id: RowId) -> bool {
        self.operations.is_tombstoned(id) || self.facilities.is_tombstoned(id)
    }

    /// Whether a facility row belongs to the current operation.
    pub fn in_scope(&self, row: &Row) -> bool {
        match self.current_operation {
            Some(op) => row
                .get("operation_id")
                .and_then(|v| v.as_ref_id())
                .is_some_and(|id| id == RowId::from(op)),
            None => false,
        }
    }

    pub fn load_operations(&mut self, rows: Vec<Row>) -> Result<(), CoreError> {
        self.operations.load(rows)
    }

    /// Switch the current operation, replacing every cached facility and
    /// facility tombstone with `rows`.
    pub fn scope_facilities(&mut self, operation: OperationId, rows: Vec<Row>) -> Result<(), CoreError> {
        let mut fresh = Collection::default();
        fresh.load(rows)?;
        self.facilities = fresh;
        self.current_operation = Some(operation);
        Ok(())
    }

    pub fn confirm_operation(&mut self, row: Row, revision: u64) -> Result<bool, CoreError> {
        if self.is_tombstoned(row.require_id()?) {
            return Ok(false);
        }
        self.operations.confirm(row, revision)?;
        Ok(true)
    }

    /// Reflect a confirmed facility write. Returns false when the row was
    /// deleted meanwhile or sits outside the current operation.
    pub fn confirm_facility(&mut self, row: Row, revision: u64) -> Result<bool, CoreError> {
        let id = row.require_id()?;
        if self.is_tombstoned(id) {
            return Ok(false);
        }
        if !self.in_scope(&row) {
            self.facilities.remove(id);
            return Ok(false);
        }
        self.facilities.confirm(row, revision)?;
        Ok(true)
    }

    pub fn remove_facility(&mut self, id: FacilityId) -> bool {
        self.facilities.tombstone(id.into()).is_some()
    }
}
