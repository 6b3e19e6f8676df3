//! Error types for MarlinDB.

use thiserror::Error;

/// Result type alias using MarlinError.
pub type Result<T> = std::result::Result<T, MarlinError>;

/// Errors that can occur in MarlinDB operations.
///
/// Every variant is recoverable: command handlers surface them to the
/// client as `-ERR <message>` replies and the connection keeps running.
#[derive(Debug, Error)]
pub enum MarlinError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Protocol errors
    #[error("cannot parse RESP command: {0}")]
    Protocol(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("syntax error")]
    Syntax,

    // Keyspace errors
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("DB index is out of range")]
    NoSuchDatabase(usize),

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    // Stream entry id errors
    #[error("invalid stream entry id: {0}")]
    InvalidEntryId(String),

    #[error("the ID specified in XADD must be greater than 0-0")]
    EntryIdZero,

    #[error("the ID specified in XADD is equal or smaller than the target stream top item")]
    EntryIdTooSmall,

    #[error("a stream entry needs at least one field value pair")]
    MissingEntryFields,

    #[error("received a stream entry field without a value")]
    UnpairedEntryField,

    // Blocking read errors
    #[error("blocking read timed out")]
    BlockTimeout,

    // Snapshot errors
    #[error("not a Redis RDB file")]
    SnapshotMagic,

    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("snapshot checksum mismatch: stored={stored}, computed={computed}")]
    SnapshotChecksum { stored: u64, computed: u64 },

    #[error("snapshot value encoding {0} not supported")]
    UnsupportedEncoding(u8),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: MarlinError = io_err.into();
        assert!(matches!(err, MarlinError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_entry_id_errors_display() {
        let err = MarlinError::InvalidEntryId("no hyphen".to_string());
        assert_eq!(err.to_string(), "invalid stream entry id: no hyphen");

        let err = MarlinError::EntryIdZero;
        assert_eq!(
            err.to_string(),
            "the ID specified in XADD must be greater than 0-0"
        );

        let err = MarlinError::EntryIdTooSmall;
        assert_eq!(
            err.to_string(),
            "the ID specified in XADD is equal or smaller than the target stream top item"
        );
    }

    #[test]
    fn test_wrong_type_display() {
        // The WRONGTYPE prefix is part of the message so the session layer
        // can prepend a bare "ERR " to every error uniformly.
        let err = MarlinError::WrongType;
        assert!(err.to_string().starts_with("WRONGTYPE"));
    }

    #[test]
    fn test_protocol_errors_display() {
        let err = MarlinError::Protocol("expected array".to_string());
        assert_eq!(err.to_string(), "cannot parse RESP command: expected array");

        let err = MarlinError::WrongArity("xadd".to_string());
        assert_eq!(
            err.to_string(),
            "wrong number of arguments for 'xadd' command"
        );
    }

    #[test]
    fn test_snapshot_errors_display() {
        let err = MarlinError::SnapshotCorrupted("truncated record".to_string());
        assert_eq!(err.to_string(), "snapshot corrupted: truncated record");

        let err = MarlinError::SnapshotChecksum {
            stored: 1,
            computed: 2,
        };
        assert_eq!(
            err.to_string(),
            "snapshot checksum mismatch: stored=1, computed=2"
        );

        let err = MarlinError::UnsupportedEncoding(14);
        assert_eq!(err.to_string(), "snapshot value encoding 14 not supported");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(MarlinError::EntryIdZero)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MarlinError>();
    }
}
