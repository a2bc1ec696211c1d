//! Error types for `keeper-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Cipher errors never include key material.

use keeper_storage::StorageError;

use crate::model::{Revision, SecretId, UserId};

/// Errors from the streaming cipher.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Decrypted padding is malformed: wrong key, corrupted or truncated
    /// ciphertext, or a stream produced with a different padding mode.
    #[error("invalid padding: {reason}")]
    Padding { reason: String },
}

impl CipherError {
    /// Wrap this error into an `io::Error` so it can travel through
    /// `AsyncRead`.
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }

    /// Recover a [`CipherError`] carried by an `io::Error` produced by the
    /// decrypt reader.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }
}

/// Errors from the vault persistence layer and the keeper service.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// A record was about to be persisted without an id.
    #[error("secret id must be non-empty")]
    EmptyId,

    /// The id cannot be used as a storage key segment.
    #[error("secret id '{id}' must not contain '/'")]
    InvalidId { id: SecretId },

    /// The operation requires an existing record.
    #[error("secret '{id}' does not exist")]
    NotExists { id: SecretId },

    /// A record with the same `(owner, id)` already exists.
    #[error("secret '{id}' already exists for owner {owner}")]
    Duplicate { owner: UserId, id: SecretId },

    /// The record exists but belongs to another user.
    #[error("access to secret '{id}' is not authorized")]
    Unauthorized { id: SecretId },

    /// The payload store has no object under this key.
    #[error("object '{key}' does not exist")]
    ObjectNotExists { key: String },

    /// Payload I/O failed.
    #[error("object '{key}' I/O failed: {source}")]
    Object {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// A metadata record could not be encoded or decoded.
    #[error("metadata serialization failed: {reason}")]
    Serialization { reason: String },

    /// The metadata backend returned an error.
    #[error("metadata storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors and non-fatal outcomes from synchronisation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Both sides already hold the same revision.
    #[error("secret '{id}' is already up to date")]
    NothingToUpdate { id: SecretId },

    /// The incoming revision is not newer than the one it would replace.
    #[error("conflict detected, secret '{id}' could not be updated (target revision {target}, incoming revision {incoming})")]
    ConflictVersion {
        id: SecretId,
        target: Revision,
        incoming: Revision,
    },

    /// The caller cancelled the transfer.
    #[error("transfer of secret '{id}' was cancelled")]
    Cancelled { id: SecretId },

    /// The payload transfer between the two sides failed.
    #[error("transfer of secret '{id}' failed: {reason}")]
    Transfer { id: SecretId, reason: String },

    /// The local store or the remote vault returned an error.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl SyncError {
    /// `true` for outcomes a batch sync logs and moves past: nothing to do,
    /// or a revision conflict awaiting explicit resolution.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NothingToUpdate { .. } | Self::ConflictVersion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_error_round_trips_through_io() {
        let io = CipherError::Padding {
            reason: "bad byte".to_owned(),
        }
        .into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
        assert!(matches!(
            CipherError::from_io(&io),
            Some(CipherError::Padding { .. })
        ));
    }

    #[test]
    fn plain_io_error_is_not_a_cipher_error() {
        let io = std::io::Error::other("disk on fire");
        assert!(CipherError::from_io(&io).is_none());
    }

    #[test]
    fn benign_sync_outcomes() {
        let id = SecretId::from("abc");
        assert!(SyncError::NothingToUpdate { id: id.clone() }.is_benign());
        assert!(
            SyncError::ConflictVersion {
                id: id.clone(),
                target: Revision::new(2),
                incoming: Revision::new(1),
            }
            .is_benign()
        );
        assert!(!SyncError::Cancelled { id: id.clone() }.is_benign());
        assert!(!SyncError::Vault(VaultError::Unauthorized { id }).is_benign());
    }
}
