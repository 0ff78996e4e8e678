pub mod error;
pub mod legacy;
pub mod schema;
pub mod sqlite;
pub mod subscription;
pub mod traits;

pub use error::{ErrorKind, LegacyError, RemoteError, StreamError};
pub use legacy::{
    JsonLegacyStore, LEGACY_STORAGE_KEY, LegacyDocument, LegacyFacility, LegacyOperation,
    LegacyPersonnel, LegacyRecord, LegacySnapshot, LegacyStore, LegacyWorkAssignment,
    MemoryLegacyStore, MigrationMarker, entry_label,
};
pub use sqlite::{AccessPolicy, SqliteRemoteStore};
pub use subscription::{SubscriberRegistry, Subscription, SubscriptionId, SubscriptionState};
pub use traits::*;
