//! Identity-scoped keeper service.
//!
//! [`KeeperService`] is the entry point for callers: every operation takes
//! the caller's [`Identity`] and only ever touches records owned by its
//! effective user. It decides between create and update, fills in missing
//! revisions, turns deletes into tombstones and refuses to hand out another
//! user's payload.
//!
//! Writes to one `(owner, id)` pair are serialised, so the existence check
//! and the write that depends on it cannot interleave with a concurrent
//! writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::VaultError;
use crate::identity::Identity;
use crate::model::{Revision, SecretId, SecretRecord, UserId};
use crate::store::{PayloadReader, VaultStore};

type LockKey = (UserId, SecretId);

/// Async mutexes keyed by `(owner, id)`, created on demand and dropped once
/// nobody holds them.
#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<LockKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, owner: UserId, id: &SecretId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.retain(|_, weak| weak.strong_count() > 0);
            let key = (owner, id.clone());
            if let Some(lock) = table.get(&key).and_then(Weak::upgrade) {
                lock
            } else {
                let lock = Arc::new(tokio::sync::Mutex::new(()));
                table.insert(key, Arc::downgrade(&lock));
                lock
            }
        };
        lock.lock_owned().await
    }
}

/// Per-identity façade over a [`VaultStore`].
pub struct KeeperService {
    vault: Arc<VaultStore>,
    locks: KeyLocks,
}

impl KeeperService {
    #[must_use]
    pub fn new(vault: Arc<VaultStore>) -> Self {
        Self {
            vault,
            locks: KeyLocks::default(),
        }
    }

    #[must_use]
    pub fn vault(&self) -> &Arc<VaultStore> {
        &self.vault
    }

    /// Open the underlying vault.
    ///
    /// # Errors
    ///
    /// See [`VaultStore::open`].
    pub async fn open(&self) -> Result<(), VaultError> {
        self.vault.open().await
    }

    /// Close the underlying vault.
    ///
    /// # Errors
    ///
    /// See [`VaultStore::close`].
    pub async fn close(&self) -> Result<(), VaultError> {
        self.vault.close().await
    }

    /// Create or update a secret owned by the caller.
    ///
    /// The record's owner is forced to the caller's effective user and an
    /// id is generated when missing. If the record already exists it is
    /// updated, taking `current.next_revision()` when no revision is given;
    /// otherwise it is created, taking [`Revision::now`] when no revision is
    /// given.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidId`] if the id contains `/`, else any error
    /// from [`VaultStore::put_secret`] or [`VaultStore::update_secret`].
    pub async fn put_secret(
        &self,
        identity: &Identity,
        mut record: SecretRecord,
        mut data: impl AsyncRead + Send + Unpin,
    ) -> Result<SecretRecord, VaultError> {
        record.owner = identity.user_id();
        if record.id.is_empty() {
            record.id = SecretId::generate();
        }
        if !record.id.is_valid() {
            return Err(VaultError::InvalidId { id: record.id });
        }
        let _guard = self.locks.acquire(record.owner, &record.id).await;

        match self
            .vault
            .get_secret_meta_by_id(&record.id, record.owner)
            .await?
        {
            Some(current) => {
                if record.revision.is_unset() {
                    record.revision = current.next_revision();
                }
                self.vault.update_secret(record, &mut data).await
            }
            None => {
                if record.revision.is_unset() {
                    record.revision = Revision::now();
                }
                self.vault.put_secret(record, &mut data).await
            }
        }
    }

    /// Soft-delete a secret: mark it deleted and bump its revision. The
    /// payload stays in place.
    ///
    /// Returns the tombstone, or `None` if there was nothing to delete.
    ///
    /// # Errors
    ///
    /// Any metadata store error.
    pub async fn delete_secret(
        &self,
        identity: &Identity,
        id: &SecretId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        let owner = identity.user_id();
        let _guard = self.locks.acquire(owner, id).await;

        let Some(mut record) = self.vault.get_secret_meta_by_id(id, owner).await? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(Some(record));
        }
        record.deleted = true;
        record.revision = record.next_revision();
        let tombstone = self.vault.update_secret_meta(record).await?;
        info!(id = %tombstone.id, owner = %owner, revision = %tombstone.revision, "secret deleted");
        Ok(Some(tombstone))
    }

    /// Remove a secret for good, metadata and payload. Returns whether
    /// anything was removed.
    ///
    /// # Errors
    ///
    /// Any store error.
    pub async fn purge_secret(&self, identity: &Identity, id: &SecretId) -> Result<bool, VaultError> {
        let owner = identity.user_id();
        let _guard = self.locks.acquire(owner, id).await;

        let Some(record) = self.vault.get_secret_meta_by_id(id, owner).await? else {
            return Ok(false);
        };
        self.vault.delete_secret(&record).await?;
        info!(id = %id, owner = %owner, "secret purged");
        Ok(true)
    }

    /// Open the payload of a live secret owned by the caller.
    ///
    /// `Ok(None)` if no such secret exists or it has been deleted.
    ///
    /// # Errors
    ///
    /// [`VaultError::Unauthorized`] if `id` belongs to another user.
    pub async fn get_secret_data(
        &self,
        identity: &Identity,
        id: &SecretId,
    ) -> Result<Option<PayloadReader>, VaultError> {
        match self.authorized_meta(identity, id).await? {
            Some(record) if !record.deleted => self.vault.open_payload(&record).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Like [`get_secret_data`](Self::get_secret_data) but also opens the
    /// payload of tombstones, so sync can carry deletions across.
    ///
    /// # Errors
    ///
    /// [`VaultError::Unauthorized`] if `id` belongs to another user.
    pub async fn open_secret_payload(
        &self,
        identity: &Identity,
        id: &SecretId,
    ) -> Result<Option<PayloadReader>, VaultError> {
        match self.authorized_meta(identity, id).await? {
            Some(record) => self.vault.open_payload(&record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Metadata of `id` under the caller, tombstones included.
    pub async fn get_secret_meta(
        &self,
        identity: &Identity,
        id: &SecretId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        self.vault
            .get_secret_meta_by_id(id, identity.user_id())
            .await
    }

    pub async fn get_secret_meta_by_alias(
        &self,
        identity: &Identity,
        alias: &str,
    ) -> Result<Option<SecretRecord>, VaultError> {
        self.vault
            .get_secret_meta_by_alias(alias, identity.user_id())
            .await
    }

    /// The caller's live secrets.
    pub async fn list_secrets(&self, identity: &Identity) -> Result<Vec<SecretRecord>, VaultError> {
        let mut records = self.list_all_secrets(identity).await?;
        records.retain(|r| !r.deleted);
        Ok(records)
    }

    /// The caller's secrets, tombstones included.
    pub async fn list_all_secrets(
        &self,
        identity: &Identity,
    ) -> Result<Vec<SecretRecord>, VaultError> {
        self.vault.list_secrets_by_user(identity.user_id()).await
    }

    /// Resolve `id` for the caller. A record found only under another owner
    /// is reported as [`VaultError::Unauthorized`], not as missing.
    async fn authorized_meta(
        &self,
        identity: &Identity,
        id: &SecretId,
    ) -> Result<Option<SecretRecord>, VaultError> {
        let owner = identity.user_id();
        if let Some(record) = self.vault.get_secret_meta_by_id(id, owner).await? {
            if record.owner != owner {
                return Err(VaultError::Unauthorized { id: id.clone() });
            }
            return Ok(Some(record));
        }
        match self.vault.locate_secret_meta(id).await? {
            Some(foreign) => {
                warn!(id = %id, owner = %owner, actual_owner = %foreign.owner, "refused access to foreign secret");
                Err(VaultError::Unauthorized { id: id.clone() })
            }
            None => {
                debug!(id = %id, owner = %owner, "secret not found");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for KeeperService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperService").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keeper_storage::MemoryBackend;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::model::SecretKind;
    use crate::store::{KvMetaStore, MemoryPayloadStore};

    fn keeper() -> (Arc<KeeperService>, MemoryPayloadStore) {
        let payloads = MemoryPayloadStore::new();
        let vault = VaultStore::new(
            Arc::new(KvMetaStore::new(Arc::new(MemoryBackend::new()))),
            Arc::new(payloads.clone()),
        );
        (Arc::new(KeeperService::new(Arc::new(vault))), payloads)
    }

    async fn read(reader: Option<PayloadReader>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_scopes_record_to_caller() {
        let (keeper, _) = keeper();
        let alice = Identity::user(UserId::new(1), "alice");

        let mut record = SecretRecord::new("wifi", SecretKind::Text);
        record.owner = UserId::new(99);
        let saved = keeper.put_secret(&alice, record, &b"pw"[..]).await.unwrap();

        assert_eq!(saved.owner, UserId::new(1));
        assert!(!saved.revision.is_unset());
        assert_eq!(read(keeper.get_secret_data(&alice, &saved.id).await.unwrap()).await, b"pw");
    }

    #[tokio::test]
    async fn second_put_updates_with_next_revision() {
        let (keeper, payloads) = keeper();
        let me = Identity::local();
        let first = keeper
            .put_secret(&me, SecretRecord::new("a", SecretKind::Text), &b"v1"[..])
            .await
            .unwrap();

        let mut again = first.clone();
        again.revision = Revision::UNSET;
        let second = keeper.put_secret(&me, again, &b"v2"[..]).await.unwrap();

        assert!(first.can_be_updated_by(&second));
        assert_eq!(read(keeper.get_secret_data(&me, &first.id).await.unwrap()).await, b"v2");
        assert_eq!(payloads.len().await, 1);
    }

    #[tokio::test]
    async fn delete_leaves_a_tombstone() {
        let (keeper, payloads) = keeper();
        let me = Identity::local();
        let saved = keeper
            .put_secret(&me, SecretRecord::new("a", SecretKind::Text), &b"x"[..])
            .await
            .unwrap();

        let tombstone = keeper.delete_secret(&me, &saved.id).await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert!(saved.can_be_updated_by(&tombstone));

        assert!(keeper.get_secret_data(&me, &saved.id).await.unwrap().is_none());
        assert!(keeper.list_secrets(&me).await.unwrap().is_empty());
        assert_eq!(keeper.list_all_secrets(&me).await.unwrap().len(), 1);
        assert!(keeper.get_secret_meta(&me, &saved.id).await.unwrap().unwrap().deleted);
        assert_eq!(payloads.len().await, 1);
        assert!(keeper.open_secret_payload(&me, &saved.id).await.unwrap().is_some());

        // Deleting again changes nothing.
        let again = keeper.delete_secret(&me, &saved.id).await.unwrap().unwrap();
        assert_eq!(again.revision, tombstone.revision);
    }

    #[tokio::test]
    async fn delete_of_missing_secret_is_a_noop() {
        let (keeper, _) = keeper();
        let got = keeper
            .delete_secret(&Identity::local(), &SecretId::from("ghost"))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn purge_removes_everything() {
        let (keeper, payloads) = keeper();
        let me = Identity::local();
        let saved = keeper
            .put_secret(&me, SecretRecord::new("a", SecretKind::Text), &b"x"[..])
            .await
            .unwrap();
        keeper.delete_secret(&me, &saved.id).await.unwrap();

        assert!(keeper.purge_secret(&me, &saved.id).await.unwrap());
        assert!(!keeper.purge_secret(&me, &saved.id).await.unwrap());
        assert!(keeper.list_all_secrets(&me).await.unwrap().is_empty());
        assert!(payloads.is_empty().await);
    }

    #[tokio::test]
    async fn foreign_secret_is_unauthorized() {
        let (keeper, _) = keeper();
        let alice = Identity::user(UserId::new(1), "alice");
        let bob = Identity::user(UserId::new(2), "bob");
        let saved = keeper
            .put_secret(&alice, SecretRecord::new("a", SecretKind::Text), &b"x"[..])
            .await
            .unwrap();

        let err = keeper.get_secret_data(&bob, &saved.id).await.err().unwrap();
        assert!(matches!(err, VaultError::Unauthorized { .. }));
        assert!(keeper.get_secret_meta(&bob, &saved.id).await.unwrap().is_none());
        assert!(keeper.list_secrets(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn separator_ids_cannot_shadow_other_ids() {
        let (keeper, payloads) = keeper();
        let alice = Identity::user(UserId::new(1), "alice");
        let bob = Identity::user(UserId::new(2), "bob");
        let mut record = SecretRecord::new("nested", SecretKind::Text);
        record.id = SecretId::from("a/b");

        let err = keeper.put_secret(&alice, record, &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidId { .. }));
        assert!(payloads.is_empty().await);
        assert!(
            keeper
                .get_secret_data(&bob, &SecretId::from("b"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn alias_lookup_is_per_identity() {
        let (keeper, _) = keeper();
        let me = Identity::local();
        keeper
            .put_secret(&me, SecretRecord::new("bank", SecretKind::CreditCard), &b"x"[..])
            .await
            .unwrap();
        let found = keeper.get_secret_meta_by_alias(&me, "bank").await.unwrap();
        assert_eq!(found.unwrap().kind, SecretKind::CreditCard);
        let other = Identity::from(UserId::new(5));
        assert!(keeper.get_secret_meta_by_alias(&other, "bank").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_puts_to_one_id_serialise() {
        let (keeper, payloads) = keeper();
        let id = SecretId::generate();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let keeper = Arc::clone(&keeper);
            let mut record = SecretRecord::new("race", SecretKind::Text);
            record.id = id.clone();
            tasks.push(tokio::spawn(async move {
                let data = vec![i];
                keeper
                    .put_secret(&Identity::local(), record, data.as_slice())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(keeper.list_secrets(&Identity::local()).await.unwrap().len(), 1);
        assert_eq!(payloads.len().await, 1);
    }
}
