use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage fault: {0}")]
    Storage(String),

    #[error("Partition '{0}' not found")]
    PartitionNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("No pending conflict for '{0}'")]
    ConflictNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "Storage fault: disk full");

        let err = SyncError::PartitionNotFound("requests".to_string());
        assert_eq!(err.to_string(), "Partition 'requests' not found");

        let err = SyncError::Decryption("bad tag".to_string());
        assert_eq!(err.to_string(), "Decryption failed: bad tag");

        let err = SyncError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network failure: connection refused");

        let err = SyncError::ConflictNotFound("hr:42".to_string());
        assert_eq!(err.to_string(), "No pending conflict for 'hr:42'");
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SyncError = parse_err.into();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[test]
    fn test_sync_result_type() {
        let ok: SyncResult<i32> = Ok(42);
        assert_eq!(ok.unwrap(), 42);

        let err: SyncResult<i32> = Err(SyncError::Internal("test".to_string()));
        assert!(err.is_err());
    }
}
