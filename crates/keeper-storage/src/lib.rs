//! Storage backend abstraction for Keeper.
//!
//! This crate defines the [`StorageBackend`] trait: a pure key-value
//! storage interface that knows nothing about secrets, revisions, or owners. The
//! metadata store in `keeper-core` serialises secret records on top of a
//! backend; payload bytes never pass through this layer.
//!
//! Two implementations are provided:
//!
//! - [`RedbBackend`]: pure-Rust persistent backend (feature `redb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and throwaway vaults

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;

pub use error::{KeyOp, StorageError};
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `meta/0/3f9a…`).
/// Values are opaque byte arrays.
///
/// Backends have an explicit lifecycle: [`open`](StorageBackend::open) must
/// succeed before any data operation, and [`close`](StorageBackend::close)
/// releases whatever handles the backend holds. Both are idempotent.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Acquire the underlying resources (files, tables).
    ///
    /// The default implementation does nothing, which suits backends that
    /// are usable from construction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the backend cannot be opened.
    async fn open(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Release the underlying resources.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Transaction`] if pending work cannot be
    /// flushed.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Key`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Key`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Key`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a cheaper check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Key`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
