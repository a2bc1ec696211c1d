//! Payload store contract and implementations.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::VaultError;

/// An owned payload byte stream.
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Keyed blob storage for encrypted payloads.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn open(&self) -> Result<(), VaultError>;

    async fn close(&self) -> Result<(), VaultError>;

    /// Store everything `data` yields under `key`, replacing any existing
    /// object. Returns the number of bytes written.
    ///
    /// A failed put leaves no object behind.
    async fn put(
        &self,
        key: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VaultError>;

    /// Open the object under `key`.
    ///
    /// # Errors
    ///
    /// [`VaultError::ObjectNotExists`] if there is no such object.
    async fn get(&self, key: &str) -> Result<PayloadReader, VaultError>;

    /// Remove the object under `key`. Removing a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), VaultError>;
}

/// One file per object under a root directory.
///
/// File names are the hex SHA-256 of the payload key, so any key is safe
/// on any filesystem. Objects are written to a temporary file in the same
/// directory and renamed into place, which makes a completed object appear
/// atomically. A failed or dropped put removes its temporary file.
#[derive(Debug, Clone)]
pub struct FilePayloadStore {
    root: PathBuf,
}

impl FilePayloadStore {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    fn object_error(key: &str, source: io::Error) -> VaultError {
        if source.kind() == io::ErrorKind::NotFound {
            VaultError::ObjectNotExists {
                key: key.to_owned(),
            }
        } else {
            VaultError::Object {
                key: key.to_owned(),
                source,
            }
        }
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    async fn open(&self) -> Result<(), VaultError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| VaultError::Object {
                key: self.root.display().to_string(),
                source,
            })?;
        debug!(root = %self.root.display(), "payload store opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), VaultError> {
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VaultError> {
        let path = self.object_path(key);
        let object_err = |source: io::Error| VaultError::Object {
            key: key.to_owned(),
            source,
        };

        // The temporary file is removed when `staged` drops, including when
        // this future is dropped mid-copy.
        let (file, staged) = tempfile::Builder::new()
            .prefix(".staged-")
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(object_err)?
            .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let n = tokio::io::copy(&mut *data, &mut file)
            .await
            .map_err(object_err)?;
        file.sync_all().await.map_err(object_err)?;
        drop(file);

        staged.persist(&path).map_err(|e| object_err(e.error))?;
        debug!(key, bytes = n, "payload stored");
        Ok(n)
    }

    async fn get(&self, key: &str) -> Result<PayloadReader, VaultError> {
        let file = tokio::fs::File::open(self.object_path(key))
            .await
            .map_err(|e| Self::object_error(key, e))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => {
                debug!(key, "payload deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(VaultError::Object {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

/// In-memory payload store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryPayloadStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryPayloadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn open(&self) -> Result<(), VaultError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), VaultError> {
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VaultError> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)
            .await
            .map_err(|source| VaultError::Object {
                key: key.to_owned(),
                source,
            })?;
        let n = bytes.len() as u64;
        self.objects.write().await.insert(key.to_owned(), bytes);
        Ok(n)
    }

    async fn get(&self, key: &str) -> Result<PayloadReader, VaultError> {
        let bytes = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::ObjectNotExists {
                key: key.to_owned(),
            })?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}
