//! Two-store vault coordinator.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::{MetadataStore, PayloadReader, PayloadStore};
use crate::error::VaultError;
use crate::model::{SecretId, SecretRecord, UserId};

/// Keeps a [`MetadataStore`] and a [`PayloadStore`] consistent.
///
/// Writes follow write-before-link, unlink-on-failure: the payload is
/// stored first, the metadata that points at it second, and a payload whose
/// metadata write failed is deleted again. Cleanup failures are logged and
/// never replace the primary error.
///
/// Both stores are owned by the `VaultStore` for its whole lifetime.
pub struct VaultStore {
    meta: Arc<dyn MetadataStore>,
    payload: Arc<dyn PayloadStore>,
}

impl VaultStore {
    #[must_use]
    pub fn new(meta: Arc<dyn MetadataStore>, payload: Arc<dyn PayloadStore>) -> Self {
        Self { meta, payload }
    }

    /// Open both stores concurrently. If either fails, both are closed
    /// before the first error is returned.
    ///
    /// # Errors
    ///
    /// The metadata store's open error, else the payload store's.
    pub async fn open(&self) -> Result<(), VaultError> {
        let (meta_opened, payload_opened) = tokio::join!(self.meta.open(), self.payload.open());
        if let Err(err) = meta_opened.and(payload_opened) {
            if let Err(close_err) = self.close().await {
                warn!(error = %close_err, "failed to close vault after open failure");
            }
            return Err(err);
        }
        debug!("vault opened");
        Ok(())
    }

    /// Close both stores concurrently. Both get the chance to close even if
    /// the other fails.
    ///
    /// # Errors
    ///
    /// The metadata store's close error, else the payload store's.
    pub async fn close(&self) -> Result<(), VaultError> {
        let (meta_closed, payload_closed) =
            tokio::join!(self.meta.close(), self.payload.close());
        meta_closed.and(payload_closed)?;
        debug!("vault closed");
        Ok(())
    }

    /// Create a secret.
    ///
    /// Assigns an id when `record.id` is empty and derives `payload_key`
    /// from `(owner, id, revision)`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Duplicate`] if `(owner, id)` already exists. Checked
    ///   before the payload is written, so an existing secret's payload is
    ///   never touched.
    /// - The payload store's error, untouched, if the payload write fails.
    /// - The metadata store's error if linking fails; the new payload is
    ///   removed first.
    pub async fn put_secret(
        &self,
        mut record: SecretRecord,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError> {
        if record.id.is_empty() {
            record.id = SecretId::generate();
        }
        if self
            .meta
            .get_meta_by_id(&record.id, record.owner)
            .await?
            .is_some()
        {
            return Err(VaultError::Duplicate {
                owner: record.owner,
                id: record.id,
            });
        }

        record.payload_key = record.derive_payload_key();
        let key = record.payload_key.clone();
        let bytes = self.payload.put(&key, data).await?;

        match self.meta.new_meta(record).await {
            Ok(saved) => {
                debug!(id = %saved.id, owner = %saved.owner, revision = %saved.revision, bytes, "secret created");
                Ok(saved)
            }
            Err(err) => {
                self.discard_payload(&key).await;
                Err(err)
            }
        }
    }

    /// Replace an existing secret with a new revision.
    ///
    /// The new payload is written under its own key, metadata is switched
    /// over, and only then is the previous payload deleted. When the
    /// revision is unchanged the derived key would collide with the live
    /// object, so the payload goes to a uniquely suffixed key instead.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotExists`] if there is no record for `(owner, id)`.
    /// - The payload store's error if the payload write fails.
    /// - The metadata store's error if the switch fails; the new payload is
    ///   removed first and the current one is left as it was.
    pub async fn update_secret(
        &self,
        mut record: SecretRecord,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError> {
        let current = self
            .meta
            .get_meta_by_id(&record.id, record.owner)
            .await?
            .ok_or_else(|| VaultError::NotExists {
                id: record.id.clone(),
            })?;

        record.payload_key = fresh_payload_key(&record, &current);
        let key = record.payload_key.clone();
        let bytes = self.payload.put(&key, data).await?;

        let saved = match self.meta.update_meta(record).await {
            Ok(saved) => saved,
            Err(err) => {
                self.discard_payload(&key).await;
                return Err(err);
            }
        };

        if !current.payload_key.is_empty() {
            self.discard_payload(&current.payload_key).await;
        }
        debug!(id = %saved.id, owner = %saved.owner, revision = %saved.revision, bytes, "secret updated");
        Ok(saved)
    }

    /// Replace metadata only, leaving the payload untouched.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotExists`] if there is no record for `(owner, id)`.
    pub async fn update_secret_meta(&self, record: SecretRecord) -> Result<SecretRecord, VaultError> {
        self.meta.update_meta(record).await
    }

    /// Open the payload of `id`. `Ok(None)` if there is no such record.
    ///
    /// # Errors
    ///
    /// [`VaultError::ObjectNotExists`] if the record exists but its payload
    /// does not, or any store error.
    pub async fn get_secret_data(
        &self,
        id: &SecretId,
        owner: UserId,
    ) -> Result<Option<PayloadReader>, VaultError> {
        match self.meta.get_meta_by_id(id, owner).await? {
            Some(record) => self.open_payload(&record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Open the payload `record` points at.
    ///
    /// # Errors
    ///
    /// [`VaultError::ObjectNotExists`] if it is missing.
    pub async fn open_payload(&self, record: &SecretRecord) -> Result<PayloadReader, VaultError> {
        self.payload.get(&record.payload_key).await
    }

    pub async fn get_secret_meta_by_id(
        &self,
        id: &SecretId,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        self.meta.get_meta_by_id(id, owner).await
    }

    pub async fn get_secret_meta_by_alias(
        &self,
        alias: &str,
        owner: UserId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        self.meta.get_meta_by_alias(alias, owner).await
    }

    /// Find `id` under any owner.
    pub async fn locate_secret_meta(
        &self,
        id: &SecretId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        self.meta.locate_meta(id).await
    }

    /// Every record of `owner`, tombstones included. Filtering is the
    /// caller's policy.
    pub async fn list_secrets_by_user(
        &self,
        owner: UserId,
    ) -> Result<Vec<SecretRecord>, VaultError> {
        self.meta.list_meta_by_user(owner).await
    }

    /// Remove a secret's metadata row and its payload object. Either may
    /// already be gone.
    ///
    /// # Errors
    ///
    /// Any store error other than absence.
    pub async fn delete_secret(&self, record: &SecretRecord) -> Result<(), VaultError> {
        let payload_key = match self.meta.get_meta_by_id(&record.id, record.owner).await? {
            Some(stored) => stored.payload_key,
            None => record.payload_key.clone(),
        };
        self.meta.delete_meta(record).await?;
        if !payload_key.is_empty() {
            self.payload.delete(&payload_key).await?;
        }
        debug!(id = %record.id, owner = %record.owner, "secret deleted");
        Ok(())
    }

    async fn discard_payload(&self, key: &str) {
        if let Err(e) = self.payload.delete(key).await {
            warn!(key, error = %e, "failed to remove unreferenced payload");
        }
    }
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore").finish_non_exhaustive()
    }
}

/// Payload key for `record` that is guaranteed to differ from the key
/// `current` points at.
fn fresh_payload_key(record: &SecretRecord, current: &SecretRecord) -> String {
    let key = record.derive_payload_key();
    if key == current.payload_key {
        format!("{key}.{:016x}", rand::random::<u64>())
    } else {
        key
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use keeper_storage::{MemoryBackend, StorageBackend};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::model::{Revision, SecretKind};
    use crate::store::{KvMetaStore, MemoryPayloadStore};

    fn vault() -> (VaultStore, MemoryPayloadStore) {
        let payloads = MemoryPayloadStore::new();
        let vault = VaultStore::new(
            Arc::new(KvMetaStore::new(Arc::new(MemoryBackend::new()))),
            Arc::new(payloads.clone()),
        );
        (vault, payloads)
    }

    fn record(owner: u64, revision: i64) -> SecretRecord {
        SecretRecord {
            owner: UserId::new(owner),
            kind: SecretKind::Text,
            revision: Revision::new(revision),
            ..SecretRecord::default()
        }
    }

    async fn read(vault: &VaultStore, id: &SecretId, owner: UserId) -> Vec<u8> {
        let mut reader = vault.get_secret_data(id, owner).await.unwrap().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_assigns_id_and_payload_key() {
        let (vault, _) = vault();
        let saved = vault.put_secret(record(1, 5), &mut &b"data"[..]).await.unwrap();
        assert_eq!(saved.id.as_str().len(), 64);
        assert_eq!(saved.payload_key, format!("1-{}-5", saved.id));
        assert_eq!(read(&vault, &saved.id, saved.owner).await, b"data");
    }

    #[tokio::test]
    async fn duplicate_create_keeps_existing_payload() {
        let (vault, payloads) = vault();
        let saved = vault.put_secret(record(1, 5), &mut &b"original"[..]).await.unwrap();

        let mut again = record(1, 5);
        again.id = saved.id.clone();
        let err = vault.put_secret(again, &mut &b"intruder"[..]).await.unwrap_err();
        assert!(matches!(err, VaultError::Duplicate { .. }));

        assert_eq!(read(&vault, &saved.id, saved.owner).await, b"original");
        assert_eq!(payloads.len().await, 1);
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let (vault, payloads) = vault();
        let mut r = record(1, 2);
        r.id = SecretId::from("ghost");
        let err = vault.update_secret(r, &mut &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, VaultError::NotExists { .. }));
        assert!(payloads.is_empty().await);
    }

    #[tokio::test]
    async fn update_replaces_payload_and_drops_old_object() {
        let (vault, payloads) = vault();
        let first = vault.put_secret(record(1, 1), &mut &b"v1"[..]).await.unwrap();

        let mut next = first.clone();
        next.revision = Revision::new(2);
        let second = vault.update_secret(next, &mut &b"v2"[..]).await.unwrap();

        assert_ne!(second.payload_key, first.payload_key);
        assert_eq!(read(&vault, &first.id, first.owner).await, b"v2");
        assert!(matches!(
            vault.open_payload(&first).await,
            Err(VaultError::ObjectNotExists { .. })
        ));
        assert_eq!(payloads.len().await, 1);
    }

    #[tokio::test]
    async fn update_with_same_revision_moves_to_a_new_object() {
        let (vault, payloads) = vault();
        let first = vault.put_secret(record(1, 1), &mut &b"v1"[..]).await.unwrap();
        let second = vault.update_secret(first.clone(), &mut &b"v1b"[..]).await.unwrap();
        assert_eq!(second.revision, first.revision);
        assert_ne!(second.payload_key, first.payload_key);
        assert_eq!(read(&vault, &first.id, first.owner).await, b"v1b");
        assert_eq!(payloads.len().await, 1);

        // And again from the suffixed key.
        let third = vault.update_secret(second.clone(), &mut &b"v1c"[..]).await.unwrap();
        assert_ne!(third.payload_key, second.payload_key);
        assert_eq!(read(&vault, &first.id, first.owner).await, b"v1c");
        assert_eq!(payloads.len().await, 1);
    }

    #[tokio::test]
    async fn missing_secret_data_is_none() {
        let (vault, _) = vault();
        let got = vault
            .get_secret_data(&SecretId::from("nope"), UserId::LOCAL)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn lookups_by_alias_and_listing() {
        let (vault, _) = vault();
        let mut r = record(3, 1);
        r.alias = "wifi".to_owned();
        let saved = vault.put_secret(r, &mut &b"x"[..]).await.unwrap();
        vault.put_secret(record(3, 1), &mut &b"y"[..]).await.unwrap();

        let by_alias = vault
            .get_secret_meta_by_alias("wifi", UserId::new(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_alias.id, saved.id);
        assert_eq!(vault.list_secrets_by_user(UserId::new(3)).await.unwrap().len(), 2);
        assert!(vault.list_secrets_by_user(UserId::new(4)).await.unwrap().is_empty());
        assert_eq!(
            vault.locate_secret_meta(&saved.id).await.unwrap().unwrap().owner,
            UserId::new(3)
        );
    }

    #[tokio::test]
    async fn delete_removes_both_halves_and_tolerates_absence() {
        let (vault, payloads) = vault();
        let saved = vault.put_secret(record(1, 1), &mut &b"x"[..]).await.unwrap();
        vault.delete_secret(&saved).await.unwrap();
        vault.delete_secret(&saved).await.unwrap();
        assert!(
            vault
                .get_secret_meta_by_id(&saved.id, saved.owner)
                .await
                .unwrap()
                .is_none()
        );
        assert!(payloads.is_empty().await);
    }

    #[derive(Default)]
    struct BrokenPayloads {
        closed: AtomicBool,
    }

    #[async_trait]
    impl PayloadStore for BrokenPayloads {
        async fn open(&self) -> Result<(), VaultError> {
            Err(VaultError::Object {
                key: "objects".to_owned(),
                source: std::io::Error::other("disk missing"),
            })
        }

        async fn close(&self) -> Result<(), VaultError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn put(
            &self,
            key: &str,
            _data: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<u64, VaultError> {
            Err(VaultError::ObjectNotExists { key: key.to_owned() })
        }

        async fn get(&self, key: &str) -> Result<PayloadReader, VaultError> {
            Err(VaultError::ObjectNotExists { key: key.to_owned() })
        }

        async fn delete(&self, _key: &str) -> Result<(), VaultError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_open_closes_the_other_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(keeper_storage::RedbBackend::new(dir.path().join("meta.redb")));
        let payloads = Arc::new(BrokenPayloads::default());
        let vault = VaultStore::new(
            Arc::new(KvMetaStore::new(Arc::clone(&backend))),
            Arc::clone(&payloads) as Arc<dyn PayloadStore>,
        );

        let err = vault.open().await.unwrap_err();
        assert!(matches!(err, VaultError::Object { .. }));
        assert!(payloads.closed.load(Ordering::SeqCst));

        // The metadata backend was closed again.
        assert!(matches!(
            backend.get("meta/0/x").await,
            Err(keeper_storage::StorageError::Closed { .. })
        ));
    }
}
