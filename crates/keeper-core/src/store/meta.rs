//! Metadata store contract and its key-value implementation.

use std::sync::Arc;

use async_trait::async_trait;
use keeper_storage::StorageBackend;
use tracing::debug;

use crate::error::VaultError;
use crate::model::{SecretId, SecretRecord, UserId};

/// Storage prefix for metadata rows.
const META_PREFIX: &str = "meta/";

/// Keyed store of [`SecretRecord`]s, unique per `(owner, id)`.
///
/// Lookups return `Ok(None)` for "not found". Errors are reserved for
/// precondition violations and backend failures.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Acquire backend resources.
    async fn open(&self) -> Result<(), VaultError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), VaultError>;

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// [`VaultError::EmptyId`] for a record without id,
    /// [`VaultError::Duplicate`] if `(owner, id)` is taken.
    async fn new_meta(&self, record: SecretRecord) -> Result<SecretRecord, VaultError>;

    async fn get_meta_by_id(
        &self,
        id: &SecretId,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError>;

    /// First record of `owner` carrying `alias`. Linear in the owner's
    /// record count.
    async fn get_meta_by_alias(
        &self,
        alias: &str,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError>;

    /// All records of `owner`, tombstones included.
    async fn list_meta_by_user(&self, owner: UserId) -> Result<Vec<SecretRecord>, VaultError>;

    /// Replace an existing record.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotExists`] if there is no record for `(owner, id)`.
    async fn update_meta(&self, record: SecretRecord) -> Result<SecretRecord, VaultError>;

    /// Remove a record. Removing an absent record succeeds.
    async fn delete_meta(&self, record: &SecretRecord) -> Result<(), VaultError>;

    /// Find a record by id under any owner.
    async fn locate_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError>;
}

/// [`MetadataStore`] over any [`StorageBackend`].
///
/// Each record is one JSON value under `meta/{owner}/{id}`, so listing an
/// owner's records is a single prefix scan.
pub struct KvMetaStore<B> {
    backend: Arc<B>,
}

impl<B: StorageBackend> KvMetaStore<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn owner_prefix(owner: UserId) -> String {
        format!("{META_PREFIX}{owner}/")
    }

    fn key(owner: UserId, id: &SecretId) -> String {
        format!("{META_PREFIX}{owner}/{id}")
    }

    async fn load(&self, key: &str) -> Result<Option<SecretRecord>, VaultError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VaultError::Serialization {
                reason: format!("{key}: {e}"),
            })
    }

    async fn store(&self, record: &SecretRecord) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec(record).map_err(|e| VaultError::Serialization {
            reason: e.to_string(),
        })?;
        self.backend
            .put(&Self::key(record.owner, &record.id), &bytes)
            .await?;
        Ok(())
    }
}

impl<B> std::fmt::Debug for KvMetaStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvMetaStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: StorageBackend> MetadataStore for KvMetaStore<B> {
    async fn open(&self) -> Result<(), VaultError> {
        Ok(self.backend.open().await?)
    }

    async fn close(&self) -> Result<(), VaultError> {
        Ok(self.backend.close().await?)
    }

    async fn new_meta(&self, record: SecretRecord) -> Result<SecretRecord, VaultError> {
        if record.id.is_empty() {
            return Err(VaultError::EmptyId);
        }
        if !record.id.is_valid() {
            return Err(VaultError::InvalidId { id: record.id });
        }
        if self
            .backend
            .exists(&Self::key(record.owner, &record.id))
            .await?
        {
            return Err(VaultError::Duplicate {
                owner: record.owner,
                id: record.id,
            });
        }
        self.store(&record).await?;
        debug!(id = %record.id, owner = %record.owner, "metadata created");
        Ok(record)
    }

    async fn get_meta_by_id(
        &self,
        id: &SecretId,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        if id.is_empty() {
            return Ok(None);
        }
        self.load(&Self::key(owner, id)).await
    }

    async fn get_meta_by_alias(
        &self,
        alias: &str,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        if alias.is_empty() {
            return Ok(None);
        }
        Ok(self
            .list_meta_by_user(owner)
            .await?
            .into_iter()
            .find(|r| r.alias == alias))
    }

    async fn list_meta_by_user(&self, owner: UserId) -> Result<Vec<SecretRecord>, VaultError> {
        let keys = self.backend.list(&Self::owner_prefix(owner)).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A row can vanish between list and get.
            if let Some(record) = self.load(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn update_meta(&self, record: SecretRecord) -> Result<SecretRecord, VaultError> {
        if record.id.is_empty() {
            return Err(VaultError::EmptyId);
        }
        if !self
            .backend
            .exists(&Self::key(record.owner, &record.id))
            .await?
        {
            return Err(VaultError::NotExists { id: record.id });
        }
        self.store(&record).await?;
        debug!(id = %record.id, owner = %record.owner, revision = %record.revision, "metadata updated");
        Ok(record)
    }

    async fn delete_meta(&self, record: &SecretRecord) -> Result<(), VaultError> {
        self.backend
            .delete(&Self::key(record.owner, &record.id))
            .await?;
        debug!(id = %record.id, owner = %record.owner, "metadata deleted");
        Ok(())
    }

    async fn locate_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError> {
        if id.is_empty() {
            return Ok(None);
        }
        let keys = self.backend.list(META_PREFIX).await?;
        let same_id = |key: &&String| {
            key.strip_prefix(META_PREFIX)
                .and_then(|rest| rest.split_once('/'))
                .is_some_and(|(_, rest)| rest == id.as_str())
        };
        for key in keys.iter().filter(same_id) {
            if let Some(record) = self.load(key).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
