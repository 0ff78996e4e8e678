pub mod adapter;
pub mod config;
pub mod error;
pub mod migration;
pub mod mirror;
pub mod reconciler;

pub use adapter::{ConnectionState, SyncAdapter};
pub use config::SyncConfig;
pub use error::EngineError;
pub use migration::{MigrationProgress, MigrationResult, Migrator, TableCounts};
pub use mirror::{CacheEntry, Mirror};
pub use reconciler::{ReconcileOutcome, Reconciler, SkipReason};
