//! Error types for scw.

use std::path::PathBuf;

use thiserror::Error;

use crate::worker::protocol::ProtocolError;

/// Main error type for scw.
#[derive(Error, Debug)]
pub enum ScwError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to create working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for scw operations.
pub type Result<T> = std::result::Result<T, ScwError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_working_directory_error_message() {
        let err = ScwError::WorkingDirectory {
            path: PathBuf::from("/readonly/WorkingDirectory/42/0"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/readonly/WorkingDirectory/42/0"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_spawn_error_message() {
        let err = ScwError::Spawn("no such file".to_string());
        assert_eq!(err.to_string(), "Failed to spawn worker: no such file");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: ScwError = ProtocolError::VersionMismatch {
            expected: 1,
            found: 7,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Protocol error"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ScwError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_error_message() {
        let err = ScwError::Config("SCW_WORKERS must be a number".to_string());
        assert!(err.to_string().contains("SCW_WORKERS"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(ScwError::Worker("gone".into()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
