use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use reliefsync_storage::{JsonLegacyStore, SqliteRemoteStore};

use crate::EngineError;

pub const ENV_PREFIX: &str = "RELIEFSYNC_";

/// Runtime settings. Every field has a default so a bare environment works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite file backing the remote store; `:memory:` for a scratch store.
    pub remote_path: String,
    /// JSON export of the browser store.
    pub legacy_export: PathBuf,
    /// Migration marker file. Defaults to a file next to the export.
    pub marker_path: Option<PathBuf>,
    /// Human-readable name for this client in logs.
    pub client_label: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_path: "reliefsync.db".into(),
            legacy_export: PathBuf::from("disaster_ops_data.json"),
            marker_path: None,
            client_label: "reliefsync".into(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from `RELIEFSYNC_*` pairs; the suffix, lowercased, names the field.
    /// Unrelated variables are ignored.
    pub fn from_vars<I>(vars: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let fields: Map<String, Value> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let field = key.strip_prefix(ENV_PREFIX)?.to_ascii_lowercase();
                Self::is_field(&field).then_some((field, Value::String(value)))
            })
            .collect();
        let config: Self = serde_json::from_value(Value::Object(fields))
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn is_field(name: &str) -> bool {
        matches!(
            name,
            "remote_path" | "legacy_export" | "marker_path" | "client_label"
        )
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.remote_path.trim().is_empty() {
            return Err(EngineError::Config("remote_path must not be empty".into()));
        }
        if self.client_label.trim().is_empty() {
            return Err(EngineError::Config("client_label must not be empty".into()));
        }
        Ok(())
    }

    pub fn legacy_store(&self) -> JsonLegacyStore {
        match &self.marker_path {
            Some(marker) => JsonLegacyStore::new(&self.legacy_export, marker),
            None => JsonLegacyStore::beside(&self.legacy_export),
        }
    }

    pub fn open_remote(&self) -> Result<SqliteRemoteStore, EngineError> {
        let store = if self.remote_path == ":memory:" {
            SqliteRemoteStore::open_in_memory()?
        } else {
            SqliteRemoteStore::open(&self.remote_path)?
        };
        Ok(store)
    }
}
