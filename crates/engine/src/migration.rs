use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use reliefsync_core::{
    AssignmentDraft, DocumentDraft, FacilityDraft, FacilityId, Filter, OperationDraft,
    OperationId, Row, RowId, Table, WorkAssignmentDraft, clock,
};
use reliefsync_storage::{
    LegacyDocument, LegacyFacility, LegacyOperation, LegacyPersonnel, LegacyRecord,
    LegacySnapshot, LegacyStore, LegacyWorkAssignment, MigrationMarker, RemoteStore, entry_label,
};

use crate::EngineError;

/// Successfully written records per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub operations: usize,
    pub facilities: usize,
    pub personnel_assignments: usize,
    pub iap_documents: usize,
    pub work_assignments: usize,
}

impl TableCounts {
    pub fn get(&self, table: Table) -> usize {
        match table {
            Table::Operations => self.operations,
            Table::Facilities => self.facilities,
            Table::PersonnelAssignments => self.personnel_assignments,
            Table::IapDocuments => self.iap_documents,
            Table::WorkAssignments => self.work_assignments,
        }
    }

    fn bump(&mut self, table: Table) {
        let slot = match table {
            Table::Operations => &mut self.operations,
            Table::Facilities => &mut self.facilities,
            Table::PersonnelAssignments => &mut self.personnel_assignments,
            Table::IapDocuments => &mut self.iap_documents,
            Table::WorkAssignments => &mut self.work_assignments,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        Table::ALL.iter().map(|t| self.get(*t)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub records_processed: usize,
    pub records_migrated: usize,
    pub errors: Vec<String>,
    #[serde(serialize_with = "millis")]
    pub duration: Duration,
    pub tables: TableCounts,
}

fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl MigrationResult {
    /// `Err(PartialMigration)` unless every record migrated.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.success {
            Ok(self)
        } else {
            Err(EngineError::PartialMigration {
                failed: self.errors.len(),
                errors: self.errors,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationProgress {
    Started { total: usize },
    TableStarted { table: Table, records: usize },
    RecordMigrated { table: Table, legacy_id: String, id: RowId },
    RecordFailed { table: Table, error: String },
    Finished { success: bool, migrated: usize, failed: usize },
}

/// Running tally of one `migrate` call.
#[derive(Default)]
struct Run {
    processed: usize,
    errors: Vec<String>,
    tables: TableCounts,
    /// Legacy id -> newly assigned remote id, per parent table.
    operations: BTreeMap<String, OperationId>,
    facilities: BTreeMap<String, FacilityId>,
}

impl Run {
    fn finish(self, started: Instant) -> MigrationResult {
        MigrationResult {
            success: self.errors.is_empty(),
            records_processed: self.processed,
            records_migrated: self.tables.total(),
            errors: self.errors,
            duration: started.elapsed(),
            tables: self.tables,
        }
    }
}

/// One-time copy of the legacy store into the remote store.
pub struct Migrator<R, L> {
    remote: R,
    legacy: L,
    progress: Option<mpsc::UnboundedSender<MigrationProgress>>,
}

impl<R: RemoteStore, L: LegacyStore> Migrator<R, L> {
    pub fn new(remote: R, legacy: L) -> Self {
        Self {
            remote,
            legacy,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<MigrationProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, event: MigrationProgress) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }

    /// True when the marker is missing, or when the remote store has no
    /// operations although the legacy store does.
    pub async fn needs_migration(&self) -> Result<bool, EngineError> {
        if self.legacy.migration_marker()?.is_none() {
            return Ok(true);
        }
        let remote = self.remote.read(Table::Operations, &Filter::all()).await?;
        if !remote.is_empty() {
            return Ok(false);
        }
        Ok(!self.legacy.load()?.operations.is_empty())
    }

    pub async fn migrate(&self) -> MigrationResult {
        let started = Instant::now();
        let mut run = Run::default();

        let snapshot = match self.legacy.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "legacy store could not be loaded");
                run.errors.push(format!("failed to load legacy data: {e}"));
                let result = run.finish(started);
                self.report(MigrationProgress::Finished {
                    success: false,
                    migrated: 0,
                    failed: 1,
                });
                return result;
            }
        };

        let total = snapshot.record_count();
        info!(records = total, "migration started");
        self.report(MigrationProgress::Started { total });
        self.migrate_snapshot(&snapshot, &mut run).await;

        if run.errors.is_empty() {
            let marker = clock::now_ms().map(|completed_at| MigrationMarker {
                completed_at,
                records_migrated: run.tables.total(),
            });
            let recorded = match marker {
                Ok(marker) => self.legacy.record_migration(&marker).map_err(EngineError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = recorded {
                warn!(error = %e, "could not record migration marker");
                run.errors.push(format!("failed to record migration marker: {e}"));
            }
        }

        let result = run.finish(started);
        info!(
            success = result.success,
            processed = result.records_processed,
            migrated = result.records_migrated,
            failed = result.errors.len(),
            duration_ms = result.duration.as_millis() as u64,
            "migration finished"
        );
        self.report(MigrationProgress::Finished {
            success: result.success,
            migrated: result.records_migrated,
            failed: result.errors.len(),
        });
        result
    }

    async fn migrate_snapshot(&self, snapshot: &LegacySnapshot, run: &mut Run) {
        self.begin(Table::Operations, snapshot.operations.len());
        for entry in &snapshot.operations {
            let migrated = self
                .migrate_record(run, Table::Operations, entry, |r: &LegacyOperation, _| {
                    operation_row(r)
                })
                .await;
            if let Some((record, id)) = migrated
                && let Some(legacy_id) = record.legacy_id()
            {
                run.operations.insert(legacy_id.to_string(), id.into());
            }
        }

        self.begin(Table::Facilities, snapshot.facilities.len());
        for entry in &snapshot.facilities {
            let migrated = self
                .migrate_record(run, Table::Facilities, entry, |r: &LegacyFacility, run| {
                    facility_row(r, &run.operations)
                })
                .await;
            if let Some((record, id)) = migrated
                && let Some(legacy_id) = record.legacy_id()
            {
                run.facilities.insert(legacy_id.to_string(), id.into());
            }
        }

        self.begin(Table::PersonnelAssignments, snapshot.personnel.len());
        for entry in &snapshot.personnel {
            self.migrate_record(run, Table::PersonnelAssignments, entry, |r: &LegacyPersonnel, run| {
                personnel_row(r, &run.facilities)
            })
            .await;
        }

        self.begin(Table::IapDocuments, snapshot.iap_documents.len());
        for entry in &snapshot.iap_documents {
            self.migrate_record(run, Table::IapDocuments, entry, |r: &LegacyDocument, run| {
                document_row(r, &run.operations)
            })
            .await;
        }

        self.begin(Table::WorkAssignments, snapshot.work_assignments.len());
        for entry in &snapshot.work_assignments {
            self.migrate_record(run, Table::WorkAssignments, entry, |r: &LegacyWorkAssignment, run| {
                work_assignment_row(r, &run.operations, &run.facilities)
            })
            .await;
        }
    }

    fn begin(&self, table: Table, records: usize) {
        if records > 0 {
            info!(%table, records, "migrating table");
        }
        self.report(MigrationProgress::TableStarted { table, records });
    }

    /// Decode, build and write one legacy entry and account for it. Every
    /// entry counts as processed, including ones that do not decode.
    async fn migrate_record<T, F>(
        &self,
        run: &mut Run,
        table: Table,
        entry: &Value,
        build: F,
    ) -> Option<(T, RowId)>
    where
        T: LegacyRecord,
        F: FnOnce(&T, &Run) -> Result<Row, String>,
    {
        run.processed += 1;
        let label = entry_label(entry);

        let record = match T::decode(entry) {
            Ok(record) => record,
            Err(e) => {
                self.reject(run, table, &label, e.to_string());
                return None;
            }
        };
        let outcome = match build(&record, run) {
            Ok(row) => match record.natural_key() {
                Ok(key) => self.upsert(table, key, row).await,
                Err(e) => Err(e.to_string()),
            },
            Err(reason) => Err(reason),
        };

        match outcome {
            Ok((key, id)) => {
                run.tables.bump(table);
                self.report(MigrationProgress::RecordMigrated {
                    table,
                    legacy_id: key,
                    id,
                });
                Some((record, id))
            }
            Err(reason) => {
                self.reject(run, table, &label, reason);
                None
            }
        }
    }

    fn reject(&self, run: &mut Run, table: Table, label: &str, reason: String) {
        let error = format!("{table} record {label}: {reason}");
        warn!(%table, record = %label, error = %reason, "record not migrated");
        self.report(MigrationProgress::RecordFailed {
            table,
            error: error.clone(),
        });
        run.errors.push(error);
    }

    /// Write `row` under its natural key, reusing the id of a row migrated by
    /// an earlier run.
    async fn upsert(&self, table: Table, key: String, mut row: Row) -> Result<(String, RowId), String> {
        let existing = self
            .remote
            .read(table, &Filter::eq_text("legacy_id", &key))
            .await
            .map_err(|e| e.to_string())?;
        if let Some(found) = existing.first() {
            row.id = found.id;
        }
        row.meta.legacy_id = Some(key.clone());
        let written = self
            .remote
            .write(table, row)
            .await
            .map_err(|e| e.to_string())?;
        let id = written.require_id().map_err(|e| e.to_string())?;
        Ok((key, id))
    }
}

// ============================================================================
// Legacy record -> row
// ============================================================================

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("missing required field {field}")),
    }
}

fn resolve<T: Copy>(
    map: &BTreeMap<String, T>,
    legacy_id: &Option<String>,
    field: &str,
) -> Result<Option<T>, String> {
    match legacy_id {
        None => Ok(None),
        Some(id) => map
            .get(id)
            .copied()
            .map(Some)
            .ok_or_else(|| format!("unknown {field} reference {id}")),
    }
}

fn operation_row(record: &LegacyOperation) -> Result<Row, String> {
    Ok(OperationDraft {
        name: required(&record.name, "name")?.to_string(),
        created_at: record.created_at,
    }
    .to_row())
}

fn facility_row(
    record: &LegacyFacility,
    operations: &BTreeMap<String, OperationId>,
) -> Result<Row, String> {
    let name = required(&record.name, "name")?;
    let operation = resolve(operations, &record.operation_id, "operation")?
        .ok_or_else(|| "missing required field operationId".to_string())?;
    Ok(FacilityDraft {
        operation_id: Some(operation),
        name: name.to_string(),
        facility_type: record.facility_type.clone(),
        address: record.address.clone(),
        status: record.status.clone(),
        capacity: record.capacity_text(),
        personnel: record.personnel_text(),
        created_at: record.created_at,
    }
    .to_row(operation))
}

fn personnel_row(
    record: &LegacyPersonnel,
    facilities: &BTreeMap<String, FacilityId>,
) -> Result<Row, String> {
    Ok(AssignmentDraft {
        facility_id: resolve(facilities, &record.facility_id, "facility")?,
        person_name: record.person_name.clone(),
        role: required(&record.role, "role")?.to_string(),
        status: record.status.clone(),
    }
    .to_row())
}

fn document_row(
    record: &LegacyDocument,
    operations: &BTreeMap<String, OperationId>,
) -> Result<Row, String> {
    let operation = resolve(operations, &record.operation_id, "operation")?
        .ok_or_else(|| "missing required field operationId".to_string())?;
    DocumentDraft {
        operation_id: operation,
        title: required(&record.title, "title")?.to_string(),
        content: Value::Object(record.content.clone()),
        created_at: record.created_at,
    }
    .to_row()
    .map_err(|e| e.to_string())
}

fn work_assignment_row(
    record: &LegacyWorkAssignment,
    operations: &BTreeMap<String, OperationId>,
    facilities: &BTreeMap<String, FacilityId>,
) -> Result<Row, String> {
    let operation = resolve(operations, &record.operation_id, "operation")?
        .ok_or_else(|| "missing required field operationId".to_string())?;
    Ok(WorkAssignmentDraft {
        operation_id: operation,
        facility_id: resolve(facilities, &record.facility_id, "facility")?,
        title: required(&record.title, "title")?.to_string(),
        status: record.status.clone(),
        created_at: record.created_at,
    }
    .to_row())
}
