//! In-process [`RemoteVaultClient`].
//!
//! [`VaultRemote`] serves another [`KeeperService`] (for example a vault on a
//! shared mount) as the remote side of a sync, under a fixed identity. It
//! is also what the sync tests run against.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::VaultError;
use crate::identity::Identity;
use crate::keeper::KeeperService;
use crate::model::{SecretId, SecretRecord};
use crate::sync::RemoteVaultClient;

/// A [`KeeperService`] addressed as a remote vault.
#[derive(Debug, Clone)]
pub struct VaultRemote {
    keeper: Arc<KeeperService>,
    identity: Identity,
}

impl VaultRemote {
    #[must_use]
    pub fn new(keeper: Arc<KeeperService>, identity: Identity) -> Self {
        Self { keeper, identity }
    }

    #[must_use]
    pub fn keeper(&self) -> &Arc<KeeperService> {
        &self.keeper
    }
}

#[async_trait]
impl RemoteVaultClient for VaultRemote {
    /// All of the identity's records, tombstones included, so deletions
    /// reach the puller.
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError> {
        self.keeper.list_all_secrets(&self.identity).await
    }

    async fn get_secret_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError> {
        self.keeper.get_secret_meta(&self.identity, id).await
    }

    async fn get_secret_data(
        &self,
        id: &SecretId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, VaultError> {
        let mut payload = self
            .keeper
            .open_secret_payload(&self.identity, id)
            .await?
            .ok_or_else(|| VaultError::NotExists { id: id.clone() })?;
        let io_error = |source| VaultError::Object {
            key: id.to_string(),
            source,
        };
        let copied = tokio::io::copy(&mut payload, &mut *sink)
            .await
            .map_err(io_error)?;
        sink.flush().await.map_err(io_error)?;
        Ok(copied)
    }

    async fn put_secret(
        &self,
        record: SecretRecord,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError> {
        self.keeper.put_secret(&self.identity, record, source).await
    }
}
