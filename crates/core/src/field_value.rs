use std::fmt;

use crate::ids::RowId;

/// A single column value as it travels between the gateway and typed records.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Text(String),
    Timestamp(i64),
    Ref(RowId),
    Bytes(Vec<u8>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            FieldValue::Timestamp(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<RowId> {
        match self {
            FieldValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Text(_) => "text",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Ref(_) => "reference",
            FieldValue::Bytes(_) => "bytes",
        }
    }

    /// `Text` for `Some`, `Null` for `None`.
    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(s) => FieldValue::Text(s.to_string()),
            None => FieldValue::Null,
        }
    }

    pub fn opt_ref(value: Option<RowId>) -> Self {
        match value {
            Some(id) => FieldValue::Ref(id),
            None => FieldValue::Null,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Timestamp(n) => write!(f, "{n}"),
            FieldValue::Ref(id) => write!(f, "{id}"),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}
