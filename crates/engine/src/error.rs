use reliefsync_core::{CoreError, FacilityId, OperationId};
use reliefsync_storage::{ErrorKind, LegacyError, RemoteError, StreamError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Stream(#[from] StreamError),

    #[error("legacy store error: {0}")]
    Legacy(#[from] LegacyError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("facility not found: {0}")]
    FacilityNotFound(FacilityId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("no active operation")]
    NoActiveOperation,

    #[error("migration incomplete: {failed} record(s) failed")]
    PartialMigration { failed: usize, errors: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(e) => e.kind(),
            Self::Stream(e) => e.kind,
            Self::Core(CoreError::Validation(_))
            | Self::FacilityNotFound(_)
            | Self::OperationNotFound(_)
            | Self::NoActiveOperation => ErrorKind::Validation,
            Self::Legacy(_) | Self::Core(_) | Self::PartialMigration { .. } | Self::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}
