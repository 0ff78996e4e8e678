use reliefsync_core::CoreError;
use thiserror::Error;

/// Coarse failure class callers branch on (retry, show "not connected", skip record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Authorization,
    Validation,
    Internal,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Connection(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("rejected by remote schema: {0}")]
    Validation(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Sqlite(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<CoreError> for RemoteError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => Self::Validation(msg),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Failure delivered on a change stream. Cloneable so one outage can be fanned
/// out to every live subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream failed ({kind:?}): {message}")]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed legacy data: {0}")]
    Json(#[from] serde_json::Error),
}
