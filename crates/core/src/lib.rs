pub mod clock;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod records;
pub mod row;
pub mod table;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use records::{
    AssignmentDraft, DocumentDraft, Facility, FacilityDraft, FacilityPatch, IapDocument,
    Operation, OperationDraft, PersonnelAssignment, Record, WorkAssignmentDraft,
};
pub use row::{Filter, FilterValue, Row, RowMeta, WriteStamp};
pub use table::{Column, ColumnKind, Table};
