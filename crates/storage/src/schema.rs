use rusqlite::Connection;

use crate::error::RemoteError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), RemoteError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

// Every table carries the same row metadata: legacy natural key, the write
// stamp of the last writer, and the commit sequence of the last write.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS commit_sequence (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO commit_sequence (singleton, value) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS operations (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    legacy_id TEXT,
    origin TEXT,
    client_revision INTEGER,
    version INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_legacy ON operations (legacy_id) WHERE legacy_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS facilities (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    operation_id BLOB NOT NULL REFERENCES operations (id),
    name TEXT NOT NULL,
    type TEXT,
    address TEXT,
    status TEXT,
    capacity TEXT,
    personnel TEXT,
    created_at INTEGER NOT NULL,
    legacy_id TEXT,
    origin TEXT,
    client_revision INTEGER,
    version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facilities_operation ON facilities (operation_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_facilities_legacy ON facilities (legacy_id) WHERE legacy_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS personnel_assignments (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    facility_id BLOB REFERENCES facilities (id) ON DELETE SET NULL,
    person_name TEXT,
    role TEXT NOT NULL,
    status TEXT,
    legacy_id TEXT,
    origin TEXT,
    client_revision INTEGER,
    version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_facility ON personnel_assignments (facility_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_legacy ON personnel_assignments (legacy_id) WHERE legacy_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS iap_documents (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    operation_id BLOB NOT NULL REFERENCES operations (id),
    title TEXT NOT NULL,
    content BLOB,
    created_at INTEGER NOT NULL,
    legacy_id TEXT,
    origin TEXT,
    client_revision INTEGER,
    version INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_legacy ON iap_documents (legacy_id) WHERE legacy_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS work_assignments (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    operation_id BLOB NOT NULL REFERENCES operations (id),
    facility_id BLOB REFERENCES facilities (id) ON DELETE SET NULL,
    title TEXT NOT NULL,
    status TEXT,
    created_at INTEGER NOT NULL,
    legacy_id TEXT,
    origin TEXT,
    client_revision INTEGER,
    version INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_work_assignments_legacy ON work_assignments (legacy_id) WHERE legacy_id IS NOT NULL;
";
