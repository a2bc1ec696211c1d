//! Storage error types.

use std::fmt;

/// The kind of single-key operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    Get,
    Put,
    Delete,
}

impl fmt::Display for KeyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "read",
            Self::Put => "write",
            Self::Delete => "delete",
        })
    }
}

/// Errors returned by a [`StorageBackend`](crate::StorageBackend).
///
/// Messages name the path, key or prefix involved. Values are never
/// included.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing file could not be created or opened.
    #[error("cannot open storage '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Data operation before `open` or after `close`.
    #[error("storage '{path}' is closed")]
    Closed { path: String },

    /// A get, put or delete of one key failed.
    #[error("cannot {op} '{key}': {reason}")]
    Key {
        op: KeyOp,
        key: String,
        reason: String,
    },

    /// A prefix scan failed part way.
    #[error("cannot list '{prefix}*': {reason}")]
    List { prefix: String, reason: String },

    #[error("table '{name}' is missing")]
    MissingTable { name: String },

    /// Beginning or committing a transaction failed.
    #[error("transaction aborted: {reason}")]
    Transaction { reason: String },
}

impl StorageError {
    pub(crate) fn key(op: KeyOp, key: &str, reason: impl fmt::Display) -> Self {
        Self::Key {
            op,
            key: key.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Whether the backend simply was not open.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_errors_name_the_operation() {
        let err = StorageError::key(KeyOp::Put, "meta/0/a", "disk full");
        assert_eq!(err.to_string(), "cannot write 'meta/0/a': disk full");
        assert!(!err.is_closed());
    }

    #[test]
    fn closed_is_recognised() {
        let err = StorageError::Closed {
            path: "/tmp/v/meta.redb".into(),
        };
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "storage '/tmp/v/meta.redb' is closed");
    }
}
