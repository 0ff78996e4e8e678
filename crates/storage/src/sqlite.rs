use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{
    Connection, params_from_iter,
    types::{Value, ValueRef},
};
use tracing::{debug, info, warn};

use reliefsync_core::{
    Column, ColumnKind, FieldValue, Filter, Row, RowId, RowMeta, Table, WriteStamp, clock,
};

use crate::error::{ErrorKind, RemoteError, StreamError};
use crate::subscription::{SubscriberRegistry, Subscription};
use crate::traits::{ChangeEvent, ChangeKind, EventSink, RemoteStore, StreamKey};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], RemoteError> {
    v.try_into()
        .map_err(|_| RemoteError::Serialization(format!("invalid {label} length")))
}

const META_COLUMNS: [&str; 4] = ["legacy_id", "origin", "client_revision", "version"];

/// Tables the caller may write to. Reads and subscriptions are always allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    writable: BTreeSet<Table>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::full()
    }
}

impl AccessPolicy {
    pub fn full() -> Self {
        Self {
            writable: Table::ALL.into_iter().collect(),
        }
    }

    pub fn read_only() -> Self {
        Self {
            writable: BTreeSet::new(),
        }
    }

    pub fn without(mut self, table: Table) -> Self {
        self.writable.remove(&table);
        self
    }

    pub fn can_write(&self, table: Table) -> bool {
        self.writable.contains(&table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    UpdateOnly,
}

/// SQLite-backed remote store. The connection lock is held while change
/// events are published, so subscribers observe per-row commit order.
pub struct SqliteRemoteStore {
    conn: Mutex<Connection>,
    registry: Arc<SubscriberRegistry>,
    reachable: AtomicBool,
    policy: Mutex<AccessPolicy>,
    label: String,
}

impl SqliteRemoteStore {
    pub fn open(path: &str) -> Result<Self, RemoteError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        info!(path, "remote store opened");
        Ok(Self::with_connection(conn, path))
    }

    pub fn open_in_memory() -> Result<Self, RemoteError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::with_connection(conn, ":memory:"))
    }

    fn with_connection(conn: Connection, label: &str) -> Self {
        Self {
            conn: Mutex::new(conn),
            registry: SubscriberRegistry::new(),
            reachable: AtomicBool::new(true),
            policy: Mutex::new(AccessPolicy::full()),
            label: label.to_string(),
        }
    }

    pub fn set_policy(&self, policy: AccessPolicy) {
        *self.policy.lock() = policy;
    }

    /// Take the store offline (or back online). Going offline terminates every
    /// live stream with a connection failure.
    pub fn set_reachable(&self, reachable: bool) {
        let _conn = self.conn.lock();
        let was = self.reachable.swap(reachable, Ordering::AcqRel);
        if was && !reachable {
            warn!(store = %self.label, "remote store went offline");
            self.registry.fail_all(StreamError {
                kind: ErrorKind::Connection,
                message: format!("lost connection to {}", self.label),
            });
        } else if !was && reachable {
            info!(store = %self.label, "remote store back online");
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Row count of a table, bypassing reachability. For diagnostics.
    pub fn count(&self, table: Table) -> Result<usize, RemoteError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn ensure_reachable(&self) -> Result<(), RemoteError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(RemoteError::Connection(format!(
                "remote store {} is unreachable",
                self.label
            )))
        }
    }

    fn ensure_writable(&self, table: Table) -> Result<(), RemoteError> {
        if self.policy.lock().can_write(table) {
            Ok(())
        } else {
            Err(RemoteError::Authorization(format!(
                "writes to {table} are not permitted"
            )))
        }
    }

    fn ensure_filterable(table: Table, filter: &Filter) -> Result<(), RemoteError> {
        for (column, _) in filter.conditions() {
            if !table.is_filterable(column) {
                return Err(RemoteError::Validation(format!(
                    "cannot filter {table} on unknown column {column}"
                )));
            }
        }
        Ok(())
    }

    fn read_rows(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError> {
        self.ensure_reachable()?;
        Self::ensure_filterable(table, filter)?;
        let conn = self.conn.lock();
        select_rows(&conn, table, filter)
    }

    fn write_row(&self, table: Table, row: Row, mode: WriteMode) -> Result<Row, RemoteError> {
        self.ensure_reachable()?;
        self.ensure_writable(table)?;
        match mode {
            WriteMode::Upsert => table.validate(&row)?,
            WriteMode::UpdateOnly => table.validate_partial(&row)?,
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let id = row.id.unwrap_or_default();
        let old = select_row(&tx, table, id)?;
        if mode == WriteMode::UpdateOnly && old.is_none() {
            return Err(RemoteError::Validation(format!(
                "{table} row {id} does not exist"
            )));
        }
        let version = next_version(&tx)?;

        let mut fields = row.fields;
        if table.column("created_at").is_some()
            && fields.get("created_at").is_none_or(FieldValue::is_null)
        {
            let existing = old
                .as_ref()
                .and_then(|o| o.get("created_at"))
                .and_then(FieldValue::as_timestamp);
            let ts = match existing {
                Some(ts) => ts,
                None => clock::now_ms()?,
            };
            fields.insert("created_at".into(), FieldValue::Timestamp(ts));
        }

        let (origin, revision) = match row.meta.stamp {
            Some(stamp) => (
                Value::Text(stamp.origin.to_string()),
                Value::Integer(stamp.revision as i64),
            ),
            None => (Value::Null, Value::Null),
        };
        let legacy_id = row
            .meta
            .legacy_id
            .clone()
            .map_or(Value::Null, Value::Text);

        let result = if old.is_some() {
            let assignments: Vec<String> = fields
                .keys()
                .enumerate()
                .map(|(i, key)| format!("\"{key}\" = ?{}", i + 1))
                .collect();
            let n = fields.len();
            let sql = format!(
                "UPDATE {table} SET {}{}legacy_id = COALESCE(?{}, legacy_id), origin = ?{}, client_revision = ?{}, version = ?{} WHERE id = ?{}",
                assignments.join(", "),
                if assignments.is_empty() { "" } else { ", " },
                n + 1,
                n + 2,
                n + 3,
                n + 4,
                n + 5,
            );
            let mut params: Vec<Value> = fields.values().map(encode_value).collect();
            params.extend([
                legacy_id,
                origin,
                revision,
                Value::Integer(version),
                Value::Blob(id.as_bytes().to_vec()),
            ]);
            tx.execute(&sql, params_from_iter(params.iter()))
        } else {
            let columns = table.columns();
            let names: Vec<String> = std::iter::once("id".to_string())
                .chain(columns.iter().map(|c| format!("\"{}\"", c.name)))
                .chain(META_COLUMNS.iter().map(|c| c.to_string()))
                .collect();
            let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                names.join(", "),
                placeholders.join(", ")
            );
            let mut params = vec![Value::Blob(id.as_bytes().to_vec())];
            params.extend(
                columns
                    .iter()
                    .map(|c| fields.get(c.name).map_or(Value::Null, encode_value)),
            );
            params.extend([legacy_id, origin, revision, Value::Integer(version)]);
            tx.execute(&sql, params_from_iter(params.iter()))
        };
        result.map_err(constraint_error)?;

        let new = select_row(&tx, table, id)?
            .ok_or_else(|| RemoteError::Serialization(format!("{table} row {id} vanished")))?;
        tx.commit()?;

        let kind = if old.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        debug!(%table, row = %id, version, kind = kind.as_str(), "row committed");
        self.registry.publish(&ChangeEvent {
            table,
            kind,
            new: Some(new.clone()),
            old,
            version,
        });
        Ok(new)
    }

    fn delete_row(&self, table: Table, id: RowId) -> Result<bool, RemoteError> {
        self.ensure_reachable()?;
        self.ensure_writable(table)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(old) = select_row(&tx, table, id)? else {
            return Ok(false);
        };
        let version = next_version(&tx)?;
        tx.execute(
            &format!("DELETE FROM {table} WHERE id = ?1"),
            [Value::Blob(id.as_bytes().to_vec())],
        )
        .map_err(constraint_error)?;
        tx.commit()?;

        debug!(%table, row = %id, version, "row deleted");
        self.registry.publish(&ChangeEvent {
            table,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            version,
        });
        Ok(true)
    }

    fn subscribe_stream(
        &self,
        table: Table,
        filter: Filter,
        sink: EventSink,
    ) -> Result<Subscription, RemoteError> {
        self.ensure_reachable()?;
        Self::ensure_filterable(table, &filter)?;
        Ok(self.registry.register(StreamKey::new(table, filter), sink))
    }
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError> {
        self.read_rows(table, filter)
    }

    async fn write(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        self.write_row(table, row, WriteMode::Upsert)
    }

    async fn update(&self, table: Table, row: Row) -> Result<Row, RemoteError> {
        self.write_row(table, row, WriteMode::UpdateOnly)
    }

    async fn delete(&self, table: Table, id: RowId) -> Result<bool, RemoteError> {
        self.delete_row(table, id)
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        sink: EventSink,
    ) -> Result<Subscription, RemoteError> {
        self.subscribe_stream(table, filter, sink)
    }
}

// ============================================================================
// Row encoding
// ============================================================================

fn constraint_error(e: rusqlite::Error) -> RemoteError {
    match e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            RemoteError::Validation(msg.unwrap_or_else(|| err.to_string()))
        }
        other => RemoteError::Sqlite(other),
    }
}

fn encode_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Timestamp(n) => Value::Integer(*n),
        FieldValue::Ref(id) => Value::Blob(id.as_bytes().to_vec()),
        FieldValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn decode_value(column: &Column, value: ValueRef<'_>) -> Result<FieldValue, RemoteError> {
    match (column.kind, value) {
        (_, ValueRef::Null) => Ok(FieldValue::Null),
        (ColumnKind::Text, ValueRef::Text(t)) => {
            Ok(FieldValue::Text(String::from_utf8_lossy(t).into_owned()))
        }
        (ColumnKind::Timestamp, ValueRef::Integer(n)) => Ok(FieldValue::Timestamp(n)),
        (ColumnKind::Ref(_), ValueRef::Blob(b)) => Ok(FieldValue::Ref(RowId::from_bytes(
            to_array::<16>(b.to_vec(), column.name)?,
        ))),
        (ColumnKind::Bytes, ValueRef::Blob(b)) => Ok(FieldValue::Bytes(b.to_vec())),
        (_, other) => Err(RemoteError::Serialization(format!(
            "column {} holds unexpected {}",
            column.name,
            other.data_type()
        ))),
    }
}

fn select_sql(table: Table) -> String {
    let columns: Vec<String> = std::iter::once("id".to_string())
        .chain(table.columns().iter().map(|c| format!("\"{}\"", c.name)))
        .chain(META_COLUMNS.iter().map(|c| c.to_string()))
        .collect();
    format!("SELECT {} FROM {table}", columns.join(", "))
}

fn decode_row(table: Table, row: &rusqlite::Row) -> Result<Row, RemoteError> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let mut out = Row::with_id(RowId::from_bytes(to_array::<16>(id_bytes, "id")?));

    let columns = table.columns();
    for (i, column) in columns.iter().enumerate() {
        let value = decode_value(column, row.get_ref(i + 1)?)?;
        out.fields.insert(column.name.to_string(), value);
    }

    let base = columns.len() + 1;
    let legacy_id: Option<String> = row.get(base)?;
    let origin: Option<String> = row.get(base + 1)?;
    let revision: Option<i64> = row.get(base + 2)?;
    let version: i64 = row.get(base + 3)?;
    let stamp = match (origin, revision) {
        (Some(origin), Some(revision)) => Some(WriteStamp {
            origin: origin.parse()?,
            revision: revision as u64,
        }),
        _ => None,
    };
    out.meta = RowMeta {
        legacy_id,
        stamp,
        version,
    };
    Ok(out)
}

fn select_rows(conn: &Connection, table: Table, filter: &Filter) -> Result<Vec<Row>, RemoteError> {
    let mut sql = select_sql(table);
    let mut params = Vec::new();
    for (i, (column, value)) in filter.conditions().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        sql.push_str(&format!("\"{column}\" = ?{}", i + 1));
        params.push(encode_value(&value));
    }
    sql.push_str(" ORDER BY version");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_row(table, row)?);
    }
    Ok(out)
}

fn select_row(conn: &Connection, table: Table, id: RowId) -> Result<Option<Row>, RemoteError> {
    Ok(select_rows(conn, table, &Filter::eq_ref("id", id))?
        .into_iter()
        .next())
}

fn next_version(conn: &Connection) -> Result<i64, RemoteError> {
    conn.execute(
        "UPDATE commit_sequence SET value = value + 1 WHERE singleton = 1",
        [],
    )?;
    Ok(conn.query_row(
        "SELECT value FROM commit_sequence WHERE singleton = 1",
        [],
        |r| r.get(0),
    )?)
}
