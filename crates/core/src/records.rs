use serde::Serialize;

use crate::{
    CoreError, FieldValue, Row, Table,
    ids::*,
};

/// A typed view of one remote table.
pub trait Record: Sized {
    const TABLE: Table;
    type Id: Copy + Ord + std::fmt::Debug + From<RowId> + Into<RowId>;

    fn id(&self) -> Self::Id;

    fn from_row(row: &Row) -> Result<Self, CoreError>;
}

fn created_at(row: &Row) -> i64 {
    row.get("created_at")
        .and_then(FieldValue::as_timestamp)
        .unwrap_or_default()
}

// ============================================================================
// Operation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub name: String,
    pub created_at: i64,
}

impl Record for Operation {
    const TABLE: Table = Table::Operations;
    type Id = OperationId;

    fn id(&self) -> OperationId {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, CoreError> {
        Ok(Self {
            id: row.require_id()?.into(),
            name: row.require_text("name")?,
            created_at: created_at(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDraft {
    pub name: String,
    pub created_at: Option<i64>,
}

impl OperationDraft {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: None,
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new().with("name", self.name.as_str());
        if let Some(ts) = self.created_at {
            row.set("created_at", FieldValue::Timestamp(ts));
        }
        row
    }
}

// ============================================================================
// Facility
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    pub id: FacilityId,
    pub operation_id: OperationId,
    pub name: String,
    #[serde(rename = "type")]
    pub facility_type: Option<String>,
    pub address: Option<String>,
    pub status: Option<String>,
    pub capacity: Option<String>,
    pub personnel: Option<String>,
    pub created_at: i64,
}

impl Record for Facility {
    const TABLE: Table = Table::Facilities;
    type Id = FacilityId;

    fn id(&self) -> FacilityId {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, CoreError> {
        Ok(Self {
            id: row.require_id()?.into(),
            operation_id: row.require_ref("operation_id")?.into(),
            name: row.require_text("name")?,
            facility_type: row.opt_text("type"),
            address: row.opt_text("address"),
            status: row.opt_text("status"),
            capacity: row.opt_text("capacity"),
            personnel: row.opt_text("personnel"),
            created_at: created_at(row),
        })
    }
}

impl Facility {
    pub fn to_row(&self) -> Row {
        Row::with_id(self.id)
            .with("operation_id", FieldValue::Ref(self.operation_id.into()))
            .with("name", self.name.as_str())
            .with("type", FieldValue::opt_text(self.facility_type.as_deref()))
            .with("address", FieldValue::opt_text(self.address.as_deref()))
            .with("status", FieldValue::opt_text(self.status.as_deref()))
            .with("capacity", FieldValue::opt_text(self.capacity.as_deref()))
            .with("personnel", FieldValue::opt_text(self.personnel.as_deref()))
            .with("created_at", FieldValue::Timestamp(self.created_at))
    }
}

/// Fields for a facility that does not exist yet. The operation defaults to
/// the adapter's current operation when left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacilityDraft {
    pub operation_id: Option<OperationId>,
    pub name: String,
    pub facility_type: Option<String>,
    pub address: Option<String>,
    pub status: Option<String>,
    pub capacity: Option<String>,
    pub personnel: Option<String>,
    pub created_at: Option<i64>,
}

impl FacilityDraft {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn to_row(&self, operation_id: OperationId) -> Row {
        let mut row = Row::new()
            .with("operation_id", FieldValue::Ref(operation_id.into()))
            .with("name", self.name.as_str())
            .with("type", FieldValue::opt_text(self.facility_type.as_deref()))
            .with("address", FieldValue::opt_text(self.address.as_deref()))
            .with("status", FieldValue::opt_text(self.status.as_deref()))
            .with("capacity", FieldValue::opt_text(self.capacity.as_deref()))
            .with("personnel", FieldValue::opt_text(self.personnel.as_deref()));
        if let Some(ts) = self.created_at {
            row.set("created_at", FieldValue::Timestamp(ts));
        }
        row
    }
}

/// Partial update. `None` leaves a field as it is; on the nullable fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacilityPatch {
    pub name: Option<String>,
    pub facility_type: Option<Option<String>>,
    pub address: Option<Option<String>>,
    pub status: Option<Option<String>>,
    pub capacity: Option<Option<String>>,
    pub personnel: Option<Option<String>>,
}

impl FacilityPatch {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(Some(status.to_string())),
            ..Self::default()
        }
    }

    pub fn renamed(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Row carrying the id and the patched columns only, so columns this
    /// patch does not name keep whatever the store holds.
    pub fn to_row(&self, id: FacilityId) -> Row {
        let mut row = Row::with_id(id);
        if let Some(name) = &self.name {
            row.set("name", name.as_str());
        }
        let nullable = [
            ("type", &self.facility_type),
            ("address", &self.address),
            ("status", &self.status),
            ("capacity", &self.capacity),
            ("personnel", &self.personnel),
        ];
        for (column, value) in nullable {
            if let Some(value) = value {
                row.set(column, FieldValue::opt_text(value.as_deref()));
            }
        }
        row
    }
}

// ============================================================================
// Personnel assignments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonnelAssignment {
    pub id: AssignmentId,
    pub facility_id: Option<FacilityId>,
    pub person_name: Option<String>,
    pub role: String,
    pub status: Option<String>,
}

impl Record for PersonnelAssignment {
    const TABLE: Table = Table::PersonnelAssignments;
    type Id = AssignmentId;

    fn id(&self) -> AssignmentId {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, CoreError> {
        Ok(Self {
            id: row.require_id()?.into(),
            facility_id: row
                .get("facility_id")
                .and_then(FieldValue::as_ref_id)
                .map(FacilityId::from),
            person_name: row.opt_text("person_name"),
            role: row.require_text("role")?,
            status: row.opt_text("status"),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDraft {
    pub facility_id: Option<FacilityId>,
    pub person_name: Option<String>,
    pub role: String,
    pub status: Option<String>,
}

impl AssignmentDraft {
    pub fn to_row(&self) -> Row {
        Row::new()
            .with("facility_id", FieldValue::opt_ref(self.facility_id.map(RowId::from)))
            .with("person_name", FieldValue::opt_text(self.person_name.as_deref()))
            .with("role", self.role.as_str())
            .with("status", FieldValue::opt_text(self.status.as_deref()))
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IapDocument {
    pub id: DocumentId,
    pub operation_id: OperationId,
    pub title: String,
    pub content: serde_json::Value,
    pub created_at: i64,
}

impl Record for IapDocument {
    const TABLE: Table = Table::IapDocuments;
    type Id = DocumentId;

    fn id(&self) -> DocumentId {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self, CoreError> {
        let content = match row.get("content").and_then(FieldValue::as_bytes) {
            Some(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| CoreError::Serialization(e.to_string()))?,
            None => serde_json::Value::Null,
        };
        Ok(Self {
            id: row.require_id()?.into(),
            operation_id: row.require_ref("operation_id")?.into(),
            title: row.require_text("title")?,
            content,
            created_at: created_at(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDraft {
    pub operation_id: OperationId,
    pub title: String,
    pub content: serde_json::Value,
    pub created_at: Option<i64>,
}

impl DocumentDraft {
    pub fn to_row(&self) -> Result<Row, CoreError> {
        let content =
            rmp_serde::to_vec(&self.content).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let mut row = Row::new()
            .with("operation_id", FieldValue::Ref(self.operation_id.into()))
            .with("title", self.title.as_str())
            .with("content", FieldValue::Bytes(content));
        if let Some(ts) = self.created_at {
            row.set("created_at", FieldValue::Timestamp(ts));
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkAssignmentDraft {
    pub operation_id: OperationId,
    pub facility_id: Option<FacilityId>,
    pub title: String,
    pub status: Option<String>,
    pub created_at: Option<i64>,
}

impl WorkAssignmentDraft {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("operation_id", FieldValue::Ref(self.operation_id.into()))
            .with("facility_id", FieldValue::opt_ref(self.facility_id.map(RowId::from)))
            .with("title", self.title.as_str())
            .with("status", FieldValue::opt_text(self.status.as_deref()));
        if let Some(ts) = self.created_at {
            row.set("created_at", FieldValue::Timestamp(ts));
        }
        row
    }
}
