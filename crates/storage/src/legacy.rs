//! Reader for the browser-era record store.
//!
//! The old client kept everything in one JSON document under the
//! `disaster_ops_data` key. Exports of it are loaded leniently: identifiers may
//! be numbers or strings, timestamps may be missing, and malformed individual
//! records are left for the migrator to reject one by one.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::LegacyError;

pub const LEGACY_STORAGE_KEY: &str = "disaster_ops_data";

/// Record groups of one export. Entries stay raw until the migrator decodes
/// them, so a wrongly typed field fails only its own record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacySnapshot {
    pub operations: Vec<Value>,
    pub facilities: Vec<Value>,
    pub personnel: Vec<Value>,
    pub iap_documents: Vec<Value>,
    pub work_assignments: Vec<Value>,
}

impl LegacySnapshot {
    pub fn parse(text: &str) -> Result<Self, LegacyError> {
        let mut value: Value = serde_json::from_str(text)?;
        // Raw localStorage dumps wrap the document under its key, often as a
        // string-encoded JSON value.
        if let Some(inner) = value.get_mut(LEGACY_STORAGE_KEY).map(Value::take) {
            value = match inner {
                Value::String(s) => serde_json::from_str(&s)?,
                other => other,
            };
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn record_count(&self) -> usize {
        self.operations.len()
            + self.facilities.len()
            + self.personnel.len()
            + self.iap_documents.len()
            + self.work_assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOperation {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFacility {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub facility_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub capacity: Option<Value>,
    #[serde(default)]
    pub personnel: Option<Value>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub created_at: Option<i64>,
}

impl LegacyFacility {
    pub fn capacity_text(&self) -> Option<String> {
        flatten_text(self.capacity.as_ref())
    }

    pub fn personnel_text(&self) -> Option<String> {
        flatten_text(self.personnel.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPersonnel {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub facility_id: Option<String>,
    #[serde(default, alias = "name")]
    pub person_name: Option<String>,
    #[serde(default, alias = "position")]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// IAP document; everything besides the identifying fields is content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDocument {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWorkAssignment {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub operation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub facility_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub created_at: Option<i64>,
}

/// Common surface the migrator needs from every legacy record.
pub trait LegacyRecord: Serialize + DeserializeOwned {
    fn legacy_id(&self) -> Option<&str>;

    fn decode(entry: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(entry)
    }

    /// Stable key for idempotent re-runs: the legacy identifier when present,
    /// otherwise a digest of the record's canonical JSON.
    fn natural_key(&self) -> Result<String, LegacyError> {
        if let Some(id) = self.legacy_id() {
            return Ok(id.to_string());
        }
        let canonical = serde_json::to_vec(self)?;
        Ok(format!("blake3:{}", blake3::hash(&canonical).to_hex()))
    }
}

macro_rules! legacy_record {
    ($($ty:ty),* $(,)?) => {
        $(
            impl LegacyRecord for $ty {
                fn legacy_id(&self) -> Option<&str> {
                    self.id.as_deref()
                }
            }
        )*
    };
}

legacy_record!(
    LegacyOperation,
    LegacyFacility,
    LegacyPersonnel,
    LegacyDocument,
    LegacyWorkAssignment,
);

/// Identifier of a raw entry for error messages, readable even when the
/// entry does not decode.
pub fn entry_label(entry: &Value) -> String {
    match entry.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "<unidentified>".to_string(),
    }
}

fn flatten_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "identifier must be a string or number, got {other}"
        ))),
    }
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// ============================================================================
// Stores
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMarker {
    pub completed_at: i64,
    pub records_migrated: usize,
}

pub trait LegacyStore: Send + Sync {
    fn load(&self) -> Result<LegacySnapshot, LegacyError>;

    fn migration_marker(&self) -> Result<Option<MigrationMarker>, LegacyError>;

    fn record_migration(&self, marker: &MigrationMarker) -> Result<(), LegacyError>;
}

impl<T: LegacyStore + ?Sized> LegacyStore for Arc<T> {
    fn load(&self) -> Result<LegacySnapshot, LegacyError> {
        (**self).load()
    }

    fn migration_marker(&self) -> Result<Option<MigrationMarker>, LegacyError> {
        (**self).migration_marker()
    }

    fn record_migration(&self, marker: &MigrationMarker) -> Result<(), LegacyError> {
        (**self).record_migration(marker)
    }
}

/// Legacy store backed by an exported JSON file plus a marker file.
#[derive(Debug, Clone)]
pub struct JsonLegacyStore {
    export_path: PathBuf,
    marker_path: PathBuf,
}

impl JsonLegacyStore {
    pub fn new(export_path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            export_path: export_path.into(),
            marker_path: marker_path.into(),
        }
    }

    /// Marker stored next to the export as `<export>.migrated.json`.
    pub fn beside(export_path: impl Into<PathBuf>) -> Self {
        let export_path = export_path.into();
        let marker_path = export_path.with_extension("migrated.json");
        Self::new(export_path, marker_path)
    }

    pub fn export_path(&self) -> &Path {
        &self.export_path
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, LegacyError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl LegacyStore for JsonLegacyStore {
    fn load(&self) -> Result<LegacySnapshot, LegacyError> {
        match read_optional(&self.export_path)? {
            Some(text) => LegacySnapshot::parse(&text),
            None => {
                debug!(path = %self.export_path.display(), "no legacy export; treating as empty");
                Ok(LegacySnapshot::default())
            }
        }
    }

    fn migration_marker(&self) -> Result<Option<MigrationMarker>, LegacyError> {
        match read_optional(&self.marker_path)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn record_migration(&self, marker: &MigrationMarker) -> Result<(), LegacyError> {
        if let Some(parent) = self.marker_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.marker_path, serde_json::to_vec_pretty(marker)?)?;
        Ok(())
    }
}

/// In-process legacy store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLegacyStore {
    snapshot: Mutex<LegacySnapshot>,
    marker: Mutex<Option<MigrationMarker>>,
    unreadable: Mutex<Option<String>>,
}

impl MemoryLegacyStore {
    pub fn new(snapshot: LegacySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    pub fn set_snapshot(&self, snapshot: LegacySnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Make every subsequent `load` fail with `reason`.
    pub fn set_unreadable(&self, reason: Option<&str>) {
        *self.unreadable.lock() = reason.map(str::to_string);
    }

    pub fn marker(&self) -> Option<MigrationMarker> {
        *self.marker.lock()
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn load(&self) -> Result<LegacySnapshot, LegacyError> {
        if let Some(reason) = self.unreadable.lock().clone() {
            return Err(std::io::Error::other(reason).into());
        }
        Ok(self.snapshot.lock().clone())
    }

    fn migration_marker(&self) -> Result<Option<MigrationMarker>, LegacyError> {
        Ok(*self.marker.lock())
    }

    fn record_migration(&self, marker: &MigrationMarker) -> Result<(), LegacyError> {
        *self.marker.lock() = Some(*marker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_lenient_identifiers_and_timestamps() -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = LegacySnapshot::parse(
            &json!({
                "operations": [{ "id": 17, "name": "Hurricane Response", "createdAt": "1700000000000" }],
                "facilities": [{
                    "id": "f-1", "operationId": 17, "name": "Shelter A", "type": "shelter",
                    "capacity": { "cots": 250 }, "personnel": "", "createdAt": 1.7e12
                }],
                "personnel": [{ "name": "R. Diaz", "position": "Shelter Manager", "facilityId": "f-1" }]
            })
            .to_string(),
        )?;

        let operation = LegacyOperation::decode(&snapshot.operations[0])?;
        assert_eq!(operation.id.as_deref(), Some("17"));
        assert_eq!(operation.created_at, Some(1_700_000_000_000));
        let facility = LegacyFacility::decode(&snapshot.facilities[0])?;
        assert_eq!(facility.operation_id.as_deref(), Some("17"));
        assert_eq!(facility.capacity_text().as_deref(), Some(r#"{"cots":250}"#));
        assert_eq!(facility.personnel_text(), None);
        let person = LegacyPersonnel::decode(&snapshot.personnel[0])?;
        assert_eq!(person.role.as_deref(), Some("Shelter Manager"));
        assert_eq!(person.person_name.as_deref(), Some("R. Diaz"));
        assert_eq!(snapshot.record_count(), 3);
        Ok(())
    }

    #[test]
    fn unwraps_raw_local_storage_dump() -> Result<(), Box<dyn std::error::Error>> {
        let inner = json!({ "operations": [{ "id": "op-1", "name": "Flood" }] }).to_string();
        let dump = json!({ LEGACY_STORAGE_KEY: inner }).to_string();
        let snapshot = LegacySnapshot::parse(&dump)?;
        assert_eq!(snapshot.operations.len(), 1);
        assert!(snapshot.facilities.is_empty());
        Ok(())
    }

    #[test]
    fn document_keeps_unknown_fields_as_content() -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = LegacySnapshot::parse(
            &json!({
                "iapDocuments": [{ "id": "d-1", "operationId": "op-1", "title": "IAP 1", "period": 1, "objectives": ["a"] }]
            })
            .to_string(),
        )?;
        let doc = LegacyDocument::decode(&snapshot.iap_documents[0])?;
        assert_eq!(doc.content.get("period"), Some(&json!(1)));
        assert!(!doc.content.contains_key("title"));
        Ok(())
    }

    #[test]
    fn wrongly_typed_field_fails_only_its_entry() -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = LegacySnapshot::parse(
            &json!({
                "facilities": [
                    { "id": "f-1", "operationId": "op-1", "name": "Shelter A" },
                    { "id": 2, "operationId": "op-1", "name": 42 }
                ]
            })
            .to_string(),
        )?;
        assert_eq!(snapshot.record_count(), 2);
        assert!(LegacyFacility::decode(&snapshot.facilities[0]).is_ok());
        assert!(LegacyFacility::decode(&snapshot.facilities[1]).is_err());
        assert_eq!(entry_label(&snapshot.facilities[1]), "2");
        assert_eq!(entry_label(&json!({ "name": "x" })), "<unidentified>");
        Ok(())
    }

    #[test]
    fn natural_key_prefers_id_and_digests_otherwise() -> Result<(), LegacyError> {
        let with_id = LegacyOperation {
            id: Some("op-1".into()),
            name: Some("Flood".into()),
            created_at: None,
        };
        assert_eq!(with_id.natural_key()?, "op-1");

        let anon = LegacyOperation {
            id: None,
            ..with_id.clone()
        };
        let key = anon.natural_key()?;
        assert!(key.starts_with("blake3:"));
        assert_eq!(key, anon.clone().natural_key()?);

        let other = LegacyOperation {
            name: Some("Fire".into()),
            ..anon
        };
        assert_ne!(other.natural_key()?, key);
        Ok(())
    }

    #[test]
    fn json_store_treats_missing_export_as_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = JsonLegacyStore::beside(dir.path().join("export.json"));
        assert!(store.load()?.is_empty());
        assert_eq!(store.migration_marker()?, None);
        Ok(())
    }

    #[test]
    fn json_store_marker_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = JsonLegacyStore::new(
            dir.path().join("export.json"),
            dir.path().join("state").join("marker.json"),
        );
        let marker = MigrationMarker {
            completed_at: 1_700_000_000_000,
            records_migrated: 4,
        };
        store.record_migration(&marker)?;
        assert_eq!(store.migration_marker()?, Some(marker));
        Ok(())
    }

    #[test]
    fn malformed_export_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("export.json");
        std::fs::write(&path, "{ not json")?;
        let store = JsonLegacyStore::beside(&path);
        assert!(matches!(store.load(), Err(LegacyError::Json(_))));
        Ok(())
    }
}
