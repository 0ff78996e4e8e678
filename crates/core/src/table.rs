use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CoreError, FieldValue, Row};

/// Remote tables, declared in migration dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Operations,
    Facilities,
    PersonnelAssignments,
    IapDocuments,
    WorkAssignments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Timestamp,
    Ref(Table),
    Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

const fn col(name: &'static str, kind: ColumnKind, required: bool) -> Column {
    Column { name, kind, required }
}

const OPERATION_COLUMNS: &[Column] = &[
    col("name", ColumnKind::Text, true),
    col("created_at", ColumnKind::Timestamp, false),
];

const FACILITY_COLUMNS: &[Column] = &[
    col("operation_id", ColumnKind::Ref(Table::Operations), true),
    col("name", ColumnKind::Text, true),
    col("type", ColumnKind::Text, false),
    col("address", ColumnKind::Text, false),
    col("status", ColumnKind::Text, false),
    col("capacity", ColumnKind::Text, false),
    col("personnel", ColumnKind::Text, false),
    col("created_at", ColumnKind::Timestamp, false),
];

const ASSIGNMENT_COLUMNS: &[Column] = &[
    col("facility_id", ColumnKind::Ref(Table::Facilities), false),
    col("person_name", ColumnKind::Text, false),
    col("role", ColumnKind::Text, true),
    col("status", ColumnKind::Text, false),
];

const DOCUMENT_COLUMNS: &[Column] = &[
    col("operation_id", ColumnKind::Ref(Table::Operations), true),
    col("title", ColumnKind::Text, true),
    col("content", ColumnKind::Bytes, false),
    col("created_at", ColumnKind::Timestamp, false),
];

const WORK_ASSIGNMENT_COLUMNS: &[Column] = &[
    col("operation_id", ColumnKind::Ref(Table::Operations), true),
    col("facility_id", ColumnKind::Ref(Table::Facilities), false),
    col("title", ColumnKind::Text, true),
    col("status", ColumnKind::Text, false),
    col("created_at", ColumnKind::Timestamp, false),
];

/// Row metadata columns that may appear in filters alongside domain columns.
pub const META_FILTER_COLUMNS: &[&str] = &["id", "legacy_id", "origin"];

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Operations,
        Table::Facilities,
        Table::PersonnelAssignments,
        Table::IapDocuments,
        Table::WorkAssignments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operations => "operations",
            Self::Facilities => "facilities",
            Self::PersonnelAssignments => "personnel_assignments",
            Self::IapDocuments => "iap_documents",
            Self::WorkAssignments => "work_assignments",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::InvalidData(format!("unknown table: {s}")))
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            Self::Operations => OPERATION_COLUMNS,
            Self::Facilities => FACILITY_COLUMNS,
            Self::PersonnelAssignments => ASSIGNMENT_COLUMNS,
            Self::IapDocuments => DOCUMENT_COLUMNS,
            Self::WorkAssignments => WORK_ASSIGNMENT_COLUMNS,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.name == name)
    }

    pub fn is_filterable(&self, name: &str) -> bool {
        META_FILTER_COLUMNS.contains(&name) || self.column(name).is_some()
    }

    /// Schema check for a row about to be written: no unknown columns, every
    /// value matches its column kind, every required column is non-null.
    pub fn validate(&self, row: &Row) -> Result<(), CoreError> {
        self.check(row, false)
    }

    /// Like [`validate`](Self::validate) for an update that names only the
    /// columns it changes. Required columns may be left out but not nulled.
    pub fn validate_partial(&self, row: &Row) -> Result<(), CoreError> {
        self.check(row, true)
    }

    fn check(&self, row: &Row, partial: bool) -> Result<(), CoreError> {
        for (key, value) in &row.fields {
            let column = self.column(key).ok_or_else(|| {
                CoreError::Validation(format!("unknown column {key} on {self}"))
            })?;
            let matches = match (column.kind, value) {
                (_, FieldValue::Null) => true,
                (ColumnKind::Text, FieldValue::Text(_)) => true,
                (ColumnKind::Timestamp, FieldValue::Timestamp(_)) => true,
                (ColumnKind::Ref(_), FieldValue::Ref(_)) => true,
                (ColumnKind::Bytes, FieldValue::Bytes(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(CoreError::Validation(format!(
                    "column {self}.{key} does not accept {} values",
                    value.kind_name()
                )));
            }
        }
        for column in self.columns().iter().filter(|c| c.required) {
            if partial && !row.fields.contains_key(column.name) {
                continue;
            }
            let present = row.fields.get(column.name).is_some_and(|v| !v.is_null());
            if !present {
                return Err(CoreError::Validation(format!(
                    "missing required column {self}.{}",
                    column.name
                )));
            }
            if let Some(FieldValue::Text(s)) = row.fields.get(column.name)
                && s.trim().is_empty()
            {
                return Err(CoreError::Validation(format!(
                    "required column {self}.{} is blank",
                    column.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
