use crate::remote::RemoteError;
use crate::store::StoreError;

/// Failure surfaced to the feed's consumer.
///
/// `Clone` so the same error can be published on a load-state or poller
/// channel and returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Post {0} is not cached")]
    NotFound(i64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SyncError {
    /// Stable short code for display lookups.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Network(_) => "error_network",
            SyncError::Api { .. } => "error_api",
            SyncError::Storage(_) => "error_db",
            SyncError::NotFound(_) => "error_not_found",
            SyncError::Cancelled => "error_cancelled",
            SyncError::Unknown(_) => "error_unknown",
        }
    }

    /// Whether retrying the same operation can succeed. Storage failures are
    /// fatal to the operation that hit them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Api { .. } | SyncError::Cancelled
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => SyncError::Network(msg),
            RemoteError::Api { status, message } => SyncError::Api { status, message },
            RemoteError::Unknown(msg) => SyncError::Unknown(msg),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        tracing::error!("Storage error: {}", err);
        SyncError::Storage(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_class() {
        assert_eq!(
            SyncError::from(RemoteError::Network("reset".into())),
            SyncError::Network("reset".into())
        );
        assert_eq!(
            SyncError::from(RemoteError::Api {
                status: 409,
                message: "conflict".into()
            }),
            SyncError::Api {
                status: 409,
                message: "conflict".into()
            }
        );
        assert_eq!(
            SyncError::from(RemoteError::Unknown("?".into())),
            SyncError::Unknown("?".into())
        );
    }

    #[test]
    fn store_errors_become_storage() {
        let err = SyncError::from(StoreError::Sql(rusqlite::Error::QueryReturnedNoRows));
        assert_eq!(err.code(), "error_db");
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_and_api_are_retryable() {
        assert!(SyncError::Network("x".into()).is_retryable());
        assert!(SyncError::Api {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Unknown("x".into()).is_retryable());
    }

    #[test]
    fn api_error_display_includes_status() {
        let err = SyncError::Api {
            status: 409,
            message: "already liked".into(),
        };
        assert_eq!(err.to_string(), "API error 409: already liked");
    }
}
