//! Revision-based synchronisation with a remote vault.
//!
//! [`SyncService`] moves secrets between local storage ([`SyncStorage`])
//! and a remote vault ([`RemoteVaultClient`]) one record at a time. Before
//! any bytes move, the two sides' metadata are compared:
//!
//! 1. Equal (same id and revision): [`SyncError::NothingToUpdate`].
//! 2. Incoming revision not strictly newer and not forced:
//!    [`SyncError::ConflictVersion`]. Conflicts are reported, never merged.
//! 3. Otherwise the payload is streamed across and the record committed.
//!
//! Pulls stream through a bounded [`pipe`](crate::pipe): the remote client
//! writes into one end while local storage reads from the other, so a
//! payload is never held in memory as a whole. The storing side's result is
//! authoritative; a failed or cancelled fetch closes the pipe with an error
//! and nothing is committed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, VaultError};
use crate::identity::Identity;
use crate::keeper::KeeperService;
use crate::model::{SecretId, SecretRecord};
use crate::pipe::{self, DEFAULT_CAPACITY};
use crate::store::PayloadReader;

/// The slice of local storage sync needs.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    async fn get_secret_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError>;

    /// Create or replace a secret, consuming `data` to its end.
    async fn put_secret(
        &self,
        record: SecretRecord,
        data: PayloadReader,
    ) -> Result<SecretRecord, VaultError>;

    /// Open a payload, tombstones included.
    async fn open_payload(&self, id: &SecretId) -> Result<Option<PayloadReader>, VaultError>;

    /// Every record eligible for push, tombstones included.
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError>;
}

/// A remote vault, reached through whatever transport the caller wires in.
#[async_trait]
pub trait RemoteVaultClient: Send + Sync {
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError>;

    /// `Ok(None)` if the remote has no such secret.
    async fn get_secret_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError>;

    /// Stream the payload of `id` into `sink`. Returns the byte count.
    async fn get_secret_data(
        &self,
        id: &SecretId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, VaultError>;

    /// Store `record` with the payload read from `source`.
    async fn put_secret(
        &self,
        record: SecretRecord,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError>;
}

/// [`SyncStorage`] backed by a [`KeeperService`] under one identity.
#[derive(Debug, Clone)]
pub struct KeeperSession {
    keeper: Arc<KeeperService>,
    identity: Identity,
}

impl KeeperSession {
    #[must_use]
    pub fn new(keeper: Arc<KeeperService>, identity: Identity) -> Self {
        Self { keeper, identity }
    }
}

#[async_trait]
impl SyncStorage for KeeperSession {
    async fn get_secret_meta(&self, id: &SecretId) -> Result<Option<SecretRecord>, VaultError> {
        self.keeper.get_secret_meta(&self.identity, id).await
    }

    async fn put_secret(
        &self,
        record: SecretRecord,
        data: PayloadReader,
    ) -> Result<SecretRecord, VaultError> {
        self.keeper.put_secret(&self.identity, record, data).await
    }

    async fn open_payload(&self, id: &SecretId) -> Result<Option<PayloadReader>, VaultError> {
        self.keeper.open_secret_payload(&self.identity, id).await
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError> {
        self.keeper.list_all_secrets(&self.identity).await
    }
}

/// A record that failed to sync, with the reason.
#[derive(Debug)]
pub struct SyncFailure {
    pub id: SecretId,
    pub error: SyncError,
}

/// Outcome of a batch sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub updated: Vec<SecretId>,
    pub unchanged: Vec<SecretId>,
    pub conflicts: Vec<SecretId>,
    pub failed: Vec<SyncFailure>,
    /// The batch stopped early because it was cancelled.
    pub cancelled: bool,
}

impl SyncReport {
    /// `true` if nothing failed and the batch ran to completion.
    /// Conflicts do not count as failures.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    fn record(&mut self, id: SecretId, outcome: Result<SecretRecord, SyncError>) {
        match outcome {
            Ok(_) => self.updated.push(id),
            Err(SyncError::Cancelled { .. }) => self.cancelled = true,
            Err(e) if !e.is_benign() => {
                error!(id = %id, error = %e, "sync failed");
                self.failed.push(SyncFailure { id, error: e });
            }
            Err(SyncError::ConflictVersion {
                target, incoming, ..
            }) => {
                warn!(id = %id, target_revision = %target, incoming_revision = %incoming, "revision conflict, skipping");
                self.conflicts.push(id);
            }
            Err(_) => {
                debug!(id = %id, "already up to date");
                self.unchanged.push(id);
            }
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} updated, {} unchanged, {} conflicts, {} failed",
            self.updated.len(),
            self.unchanged.len(),
            self.conflicts.len(),
            self.failed.len()
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Reconciles local storage with a remote vault.
pub struct SyncService {
    client: Arc<dyn RemoteVaultClient>,
    storage: Arc<dyn SyncStorage>,
    pipe_capacity: usize,
}

impl SyncService {
    #[must_use]
    pub fn new(client: Arc<dyn RemoteVaultClient>, storage: Arc<dyn SyncStorage>) -> Self {
        Self {
            client,
            storage,
            pipe_capacity: DEFAULT_CAPACITY,
        }
    }

    /// Bytes a pull may have in flight between fetch and store.
    #[must_use]
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Bring the remote version of `remote` into local storage.
    ///
    /// `force` skips the revision check, letting an older remote revision
    /// overwrite the local one.
    ///
    /// # Errors
    ///
    /// [`SyncError::NothingToUpdate`], [`SyncError::ConflictVersion`],
    /// [`SyncError::Cancelled`], or the failure of either side.
    pub async fn pull(
        &self,
        remote: &SecretRecord,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SecretRecord, SyncError> {
        let id = &remote.id;
        if let Some(local) = self.storage.get_secret_meta(id).await? {
            check_transition(&local, remote, force)?;
        }

        let (mut writer, reader) = pipe::pipe(self.pipe_capacity);

        let fetch = async {
            let fetched = tokio::select! {
                () = cancel.cancelled() => Err(SyncError::Cancelled { id: id.clone() }),
                r = self.client.get_secret_data(id, &mut writer) => r.map_err(SyncError::from),
            };
            match fetched {
                Ok(bytes) => writer.finish().await.map(|()| bytes).map_err(|e| {
                    SyncError::Transfer {
                        id: id.clone(),
                        reason: e.to_string(),
                    }
                }),
                Err(e) => {
                    writer.fail(e.to_string());
                    Err(e)
                }
            }
        };

        let store = async {
            tokio::select! {
                () = cancel.cancelled() => Err(SyncError::Cancelled { id: id.clone() }),
                r = self.storage.put_secret(remote.clone(), Box::new(reader)) => r.map_err(SyncError::from),
            }
        };

        let (fetched, stored) = tokio::join!(fetch, store);
        match (fetched, stored) {
            (Ok(bytes), Ok(saved)) => {
                info!(id = %id, revision = %saved.revision, bytes, "secret pulled");
                Ok(saved)
            }
            (Err(e), Ok(saved)) => {
                // The store saw a finished stream, so the payload is whole.
                debug!(id = %id, error = %e, "fetch reported an error after completing");
                Ok(saved)
            }
            (_, Err(e)) => Err(e),
        }
    }

    /// Pull the remote secret `id`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotExists`] if the remote has no such secret, else as
    /// [`pull`](Self::pull).
    pub async fn pull_by_id(
        &self,
        id: &SecretId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SecretRecord, SyncError> {
        let remote = self
            .client
            .get_secret_meta(id)
            .await?
            .ok_or_else(|| VaultError::NotExists { id: id.clone() })?;
        self.pull(&remote, force, cancel).await
    }

    /// Send the local version of `local` to the remote.
    ///
    /// # Errors
    ///
    /// As [`pull`](Self::pull), with the roles reversed.
    pub async fn push(
        &self,
        local: &SecretRecord,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SecretRecord, SyncError> {
        let id = &local.id;
        if let Some(remote) = self.client.get_secret_meta(id).await? {
            check_transition(&remote, local, force)?;
        }

        let mut payload = self
            .storage
            .open_payload(id)
            .await?
            .ok_or_else(|| VaultError::NotExists { id: id.clone() })?;

        let saved = tokio::select! {
            () = cancel.cancelled() => Err(SyncError::Cancelled { id: id.clone() }),
            r = self.client.put_secret(local.clone(), &mut payload) => r.map_err(SyncError::from),
        }?;
        info!(id = %id, revision = %saved.revision, "secret pushed");
        Ok(saved)
    }

    /// Push the local secret `id`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotExists`] if there is no such local secret, else as
    /// [`push`](Self::push).
    pub async fn push_by_id(
        &self,
        id: &SecretId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SecretRecord, SyncError> {
        let local = self
            .storage
            .get_secret_meta(id)
            .await?
            .ok_or_else(|| VaultError::NotExists { id: id.clone() })?;
        self.push(&local, force, cancel).await
    }

    /// Pull every remote secret. Per-secret outcomes go into the report;
    /// the batch only fails if the remote listing does.
    ///
    /// # Errors
    ///
    /// The remote's listing error.
    pub async fn pull_all(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let records = self.client.list_secrets().await?;
        let mut report = SyncReport::default();
        for record in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.pull(&record, force, cancel).await;
            report.record(record.id, outcome);
        }
        info!(%report, "pull finished");
        Ok(report)
    }

    /// Push every local secret, tombstones included.
    ///
    /// # Errors
    ///
    /// The local listing error.
    pub async fn push_all(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let records = self.storage.list_secrets().await?;
        let mut report = SyncReport::default();
        for record in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.push(&record, force, cancel).await;
            report.record(record.id, outcome);
        }
        info!(%report, "push finished");
        Ok(report)
    }
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("pipe_capacity", &self.pipe_capacity)
            .finish_non_exhaustive()
    }
}

/// Decide whether `incoming` may replace `target`.
fn check_transition(
    target: &SecretRecord,
    incoming: &SecretRecord,
    force: bool,
) -> Result<(), SyncError> {
    if target == incoming {
        return Err(SyncError::NothingToUpdate {
            id: incoming.id.clone(),
        });
    }
    if !force && !target.can_be_updated_by(incoming) {
        return Err(SyncError::ConflictVersion {
            id: incoming.id.clone(),
            target: target.revision,
            incoming: incoming.revision,
        });
    }
    Ok(())
}
