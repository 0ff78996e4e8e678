use std::collections::BTreeMap;
use std::fmt;

use crate::{
    CoreError, FieldValue,
    ids::{ClientId, RowId},
};

/// Identity a client attaches to every write so it can recognise the echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStamp {
    pub origin: ClientId,
    pub revision: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowMeta {
    /// Natural key of the legacy record this row was migrated from.
    pub legacy_id: Option<String>,
    pub stamp: Option<WriteStamp>,
    /// Server commit sequence of the last write; 0 for rows not yet written.
    pub version: i64,
}

/// Untyped record as the gateway reads and writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub id: Option<RowId>,
    pub fields: BTreeMap<String, FieldValue>,
    pub meta: RowMeta,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<RowId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn require_id(&self) -> Result<RowId, CoreError> {
        self.id
            .ok_or_else(|| CoreError::InvalidData("row has no identifier".into()))
    }

    pub fn require_text(&self, key: &str) -> Result<String, CoreError> {
        self.text(key)
            .map(str::to_string)
            .ok_or_else(|| CoreError::InvalidData(format!("row is missing text column {key}")))
    }

    pub fn require_ref(&self, key: &str) -> Result<RowId, CoreError> {
        self.get(key)
            .and_then(FieldValue::as_ref_id)
            .ok_or_else(|| CoreError::InvalidData(format!("row is missing reference column {key}")))
    }

    pub fn opt_text(&self, key: &str) -> Option<String> {
        self.text(key).map(str::to_string)
    }

    /// Value of a domain or metadata column, used for filter matching.
    pub fn column_value(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => self.id.map(FieldValue::Ref),
            "legacy_id" => self.meta.legacy_id.clone().map(FieldValue::Text),
            "origin" => self
                .meta
                .stamp
                .map(|s| FieldValue::Text(s.origin.to_string())),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Same domain content, ignoring metadata.
    pub fn same_content(&self, other: &Row) -> bool {
        self.id == other.id && self.fields == other.fields
    }
}

/// Conjunction of column equality predicates scoping a read or a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter {
    conditions: Vec<(String, FilterValue)>,
}

/// `FieldValue` restricted to what a filter can compare, so `Filter` can be a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterValue {
    Text(String),
    Ref(RowId),
}

impl From<FilterValue> for FieldValue {
    fn from(v: FilterValue) -> Self {
        match v {
            FilterValue::Text(s) => FieldValue::Text(s),
            FilterValue::Ref(id) => FieldValue::Ref(id),
        }
    }
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq_ref(column: &str, id: impl Into<RowId>) -> Self {
        Self::all().and_ref(column, id)
    }

    pub fn eq_text(column: &str, value: &str) -> Self {
        Self::all().and_text(column, value)
    }

    pub fn and_ref(mut self, column: &str, id: impl Into<RowId>) -> Self {
        self.conditions
            .push((column.to_string(), FilterValue::Ref(id.into())));
        self
    }

    pub fn and_text(mut self, column: &str, value: &str) -> Self {
        self.conditions
            .push((column.to_string(), FilterValue::Text(value.to_string())));
        self
    }

    pub fn is_all(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, FieldValue)> {
        self.conditions
            .iter()
            .map(|(c, v)| (c.as_str(), FieldValue::from(v.clone())))
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions()
            .all(|(column, expected)| row.column_value(column).as_ref() == Some(&expected))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return f.write_str("*");
        }
        for (i, (column, value)) in self.conditions().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{column}=eq.{value}")?;
        }
        Ok(())
    }
}
