//! Pure-Rust redb storage backend.
//!
//! redb is a single-file B-tree database with ACID transactions and no C
//! dependencies, which keeps the whole vault buildable with `cargo` alone.
//! Feature-gated behind `redb-backend`.
//!
//! The database file is created on [`open`](StorageBackend::open) and the
//! handle is dropped on [`close`](StorageBackend::close). Every operation
//! runs in its own transaction on the Tokio blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::RwLock;

use crate::{KeyOp, StorageBackend, StorageError};

/// The single table used for all key-value data.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// A storage backend backed by a redb database file.
///
/// # Examples
///
/// ```no_run
/// # use keeper_storage::{RedbBackend, StorageBackend};
/// # async fn run() -> Result<(), keeper_storage::StorageError> {
/// let backend = RedbBackend::new("/var/lib/keeper/meta.redb");
/// backend.open().await?;
/// backend.put("meta/0/abc", b"{}").await?;
/// backend.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedbBackend {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Create a closed backend for the database file at `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            db: RwLock::new(None),
        }
    }

    /// Return the filesystem path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn handle(&self) -> Result<Arc<Database>, StorageError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::Closed {
                path: self.path.display().to_string(),
            })
    }
}

/// Run a redb closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("redb worker died: {e}"),
        })?
}

fn txn_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn table_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::MissingTable {
        name: format!("data: {e}"),
    }
}

/// Apply `op` to the data table inside one committed write transaction.
fn write_data<F>(db: &Database, op: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<(), StorageError>,
{
    let txn = db.begin_write().map_err(txn_error)?;
    {
        let mut table = txn.open_table(DATA_TABLE).map_err(table_error)?;
        op(&mut table)?;
    }
    txn.commit().map_err(txn_error)
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn open(&self) -> Result<(), StorageError> {
        let mut guard = self.db.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let db = blocking(move || {
            let open_error = |e: &dyn std::fmt::Display| StorageError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| open_error(&e))?;
            }
            let db = Database::create(&path).map_err(|e| open_error(&e))?;
            // An empty write creates the table on first use.
            write_data(&db, |_| Ok(()))?;
            Ok(db)
        })
        .await?;

        tracing::debug!(path = %self.path.display(), "metadata database opened");
        *guard = Some(Arc::new(db));
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.db.write().await.take().is_some() {
            tracing::debug!(path = %self.path.display(), "metadata database closed");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = self.handle().await?;
        let key = key.to_owned();
        blocking(move || {
            let txn = db.begin_read().map_err(txn_error)?;
            let table = txn.open_table(DATA_TABLE).map_err(table_error)?;
            let found = table
                .get(key.as_str())
                .map_err(|e| StorageError::key(KeyOp::Get, &key, e))?;
            Ok(found.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let db = self.handle().await?;
        let key = key.to_owned();
        let value = value.to_vec();
        blocking(move || {
            write_data(&db, |table| {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map(drop)
                    .map_err(|e| StorageError::key(KeyOp::Put, &key, e))
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let db = self.handle().await?;
        let key = key.to_owned();
        blocking(move || {
            write_data(&db, |table| {
                table
                    .remove(key.as_str())
                    .map(drop)
                    .map_err(|e| StorageError::key(KeyOp::Delete, &key, e))
            })
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = self.handle().await?;
        let prefix = prefix.to_owned();
        blocking(move || {
            let list_error = |e: &dyn std::fmt::Display| StorageError::List {
                prefix: prefix.clone(),
                reason: e.to_string(),
            };
            let txn = db.begin_read().map_err(txn_error)?;
            let table = txn.open_table(DATA_TABLE).map_err(table_error)?;

            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(|e| list_error(&e))? {
                let (k, _) = entry.map_err(|e| list_error(&e))?;
                match k.value() {
                    key if key.starts_with(prefix.as_str()) => keys.push(key.to_owned()),
                    _ => break,
                }
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend(dir: &tempfile::TempDir) -> RedbBackend {
        RedbBackend::new(dir.path().join("nested").join("meta.redb"))
    }

    #[tokio::test]
    async fn operations_fail_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let result = backend.get("meta/0/a").await;
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        backend.open().await.unwrap();

        backend.put("meta/1/a", b"one").await.unwrap();
        backend.put("meta/1/b", b"two").await.unwrap();
        backend.put("meta/2/c", b"three").await.unwrap();

        assert_eq!(backend.get("meta/1/a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            backend.list("meta/1/").await.unwrap(),
            vec!["meta/1/a", "meta/1/b"]
        );

        backend.delete("meta/1/a").await.unwrap();
        backend.delete("meta/1/a").await.unwrap();
        assert!(!backend.exists("meta/1/a").await.unwrap());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        backend.open().await.unwrap();
        backend.put("meta/0/x", b"persisted").await.unwrap();
        backend.close().await.unwrap();

        assert!(backend.put("meta/0/y", b"").await.unwrap_err().is_closed());

        backend.open().await.unwrap();
        assert_eq!(
            backend.get("meta/0/x").await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        backend.open().await.unwrap();
        backend.open().await.unwrap();
        backend.close().await.unwrap();
        backend.close().await.unwrap();
    }
}
