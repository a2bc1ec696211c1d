//! Pull and push between two in-memory vaults.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use async_trait::async_trait;
use keeper_core::error::{SyncError, VaultError};
use keeper_core::identity::Identity;
use keeper_core::keeper::KeeperService;
use keeper_core::model::{Revision, SecretId, SecretKind, SecretRecord, UserId};
use keeper_core::remote::VaultRemote;
use keeper_core::store::{FilePayloadStore, KvMetaStore, MemoryPayloadStore, VaultStore};
use keeper_core::sync::{KeeperSession, RemoteVaultClient, SyncService};
use keeper_storage::MemoryBackend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

struct Side {
    keeper: Arc<KeeperService>,
    identity: Identity,
    payloads: MemoryPayloadStore,
}

impl Side {
    fn new(identity: Identity) -> Self {
        let payloads = MemoryPayloadStore::new();
        let vault = VaultStore::new(
            Arc::new(KvMetaStore::new(Arc::new(MemoryBackend::new()))),
            Arc::new(payloads.clone()),
        );
        Self {
            keeper: Arc::new(KeeperService::new(Arc::new(vault))),
            identity,
            payloads,
        }
    }

    async fn put(&self, id: &str, revision: i64, data: &[u8]) -> SecretRecord {
        let mut record = SecretRecord::new(id, SecretKind::Text);
        record.id = SecretId::from(id);
        record.revision = Revision::new(revision);
        self.keeper
            .put_secret(&self.identity, record, data)
            .await
            .unwrap()
    }

    async fn read(&self, id: &str) -> Vec<u8> {
        let mut out = Vec::new();
        self.keeper
            .get_secret_data(&self.identity, &SecretId::from(id))
            .await
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    async fn meta(&self, id: &str) -> Option<SecretRecord> {
        self.keeper
            .get_secret_meta(&self.identity, &SecretId::from(id))
            .await
            .unwrap()
    }

    fn session(&self) -> Arc<KeeperSession> {
        Arc::new(KeeperSession::new(
            Arc::clone(&self.keeper),
            self.identity.clone(),
        ))
    }

    fn remote(&self) -> Arc<VaultRemote> {
        Arc::new(VaultRemote::new(
            Arc::clone(&self.keeper),
            self.identity.clone(),
        ))
    }
}

fn pair() -> (Side, Side, SyncService) {
    let local = Side::new(Identity::local());
    let remote = Side::new(Identity::user(UserId::new(42), "me"));
    let sync = SyncService::new(remote.remote(), local.session()).with_pipe_capacity(16);
    (local, remote, sync)
}

#[tokio::test]
async fn pull_creates_missing_local_secret() {
    let (local, remote, sync) = pair();
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    remote.put("doc", 3, &big).await;

    let pulled = sync
        .pull_by_id(&SecretId::from("doc"), false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(pulled.revision, Revision::new(3));
    assert_eq!(pulled.owner, UserId::LOCAL);
    assert_eq!(local.read("doc").await, big);
}

#[tokio::test]
async fn equal_revisions_are_nothing_to_update() {
    let (local, remote, sync) = pair();
    local.put("a", 5, b"same").await;
    let theirs = remote.put("a", 5, b"same").await;

    let err = sync
        .pull(&theirs, true, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NothingToUpdate { .. }));
    assert!(err.is_benign());
}

#[tokio::test]
async fn older_remote_conflicts_unless_forced() {
    let (local, remote, sync) = pair();
    local.put("a", 10, b"local").await;
    let theirs = remote.put("a", 4, b"remote").await;
    let cancel = CancellationToken::new();

    let err = sync.pull(&theirs, false, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::ConflictVersion { target, incoming, .. }
            if target == Revision::new(10) && incoming == Revision::new(4)
    ));
    assert_eq!(local.meta("a").await.unwrap().revision, Revision::new(10));
    assert_eq!(local.read("a").await, b"local");

    let forced = sync.pull(&theirs, true, &cancel).await.unwrap();
    assert_eq!(forced.revision, Revision::new(4));
    assert_eq!(local.meta("a").await.unwrap().revision, Revision::new(4));
    assert_eq!(local.read("a").await, b"remote");
    assert_eq!(local.payloads.len().await, 1);
}

#[tokio::test]
async fn newer_remote_replaces_local() {
    let (local, remote, sync) = pair();
    local.put("a", 1, b"old").await;
    let theirs = remote.put("a", 2, b"new").await;

    sync.pull(&theirs, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(local.read("a").await, b"new");
}

#[tokio::test]
async fn push_is_symmetric() {
    let (local, remote, sync) = pair();
    local.put("a", 7, b"from local").await;
    remote.put("b", 9, b"remote newer").await;
    local.put("b", 3, b"local older").await;
    let cancel = CancellationToken::new();

    let pushed = sync
        .push_by_id(&SecretId::from("a"), false, &cancel)
        .await
        .unwrap();
    assert_eq!(pushed.owner, UserId::new(42));
    assert_eq!(remote.read("a").await, b"from local");

    let err = sync
        .push_by_id(&SecretId::from("b"), false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictVersion { .. }));
    assert_eq!(remote.read("b").await, b"remote newer");
}

#[tokio::test]
async fn pull_all_continues_past_conflicts() {
    let (local, remote, sync) = pair();
    remote.put("new", 1, b"n").await;
    remote.put("same", 2, b"s").await;
    remote.put("stale", 1, b"r").await;
    local.put("same", 2, b"s").await;
    local.put("stale", 5, b"l").await;

    let report = sync
        .pull_all(false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.updated, vec![SecretId::from("new")]);
    assert_eq!(report.unchanged, vec![SecretId::from("same")]);
    assert_eq!(report.conflicts, vec![SecretId::from("stale")]);
    assert!(report.is_clean());
    assert_eq!(local.read("new").await, b"n");
}

#[tokio::test]
async fn push_all_carries_tombstones() {
    let (local, remote, sync) = pair();
    let first = local.put("gone", 1, b"x").await;
    sync.push_all(false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(remote.meta("gone").await.is_some());

    local
        .keeper
        .delete_secret(&local.identity, &first.id)
        .await
        .unwrap();
    let report = sync
        .push_all(false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.updated.len(), 1);
    assert!(remote.meta("gone").await.unwrap().deleted);
    assert!(
        remote
            .keeper
            .list_secrets(&remote.identity)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn cancelled_batch_stops_early() {
    let (_local, remote, sync) = pair();
    remote.put("a", 1, b"a").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = sync.pull_all(false, &cancel).await.unwrap();
    assert!(report.cancelled);
    assert!(report.updated.is_empty());
    assert!(!report.is_clean());
}

/// Remote that sends a few bytes of the payload and then fails.
struct DroppingRemote {
    record: SecretRecord,
}

#[async_trait]
impl RemoteVaultClient for DroppingRemote {
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError> {
        Ok(vec![self.record.clone()])
    }

    async fn get_secret_meta(&self, _id: &SecretId) -> Result<Option<SecretRecord>, VaultError> {
        Ok(Some(self.record.clone()))
    }

    async fn get_secret_data(
        &self,
        id: &SecretId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, VaultError> {
        sink.write_all(b"half a sec").await.unwrap();
        Err(VaultError::Object {
            key: id.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "link dropped"),
        })
    }

    async fn put_secret(
        &self,
        record: SecretRecord,
        _source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError> {
        Ok(record)
    }
}

#[tokio::test]
async fn failed_fetch_commits_nothing() {
    let local = Side::new(Identity::local());
    let record = SecretRecord {
        id: SecretId::from("flaky"),
        revision: Revision::new(3),
        ..SecretRecord::default()
    };
    let sync = SyncService::new(Arc::new(DroppingRemote { record }), local.session());

    let report = sync
        .pull_all(false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(!report.failed[0].error.is_benign());

    assert!(local.meta("flaky").await.is_none());
    assert!(local.payloads.is_empty().await);
}

/// Remote whose payload stream never ends.
struct StallingRemote {
    record: SecretRecord,
}

#[async_trait]
impl RemoteVaultClient for StallingRemote {
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, VaultError> {
        Ok(vec![self.record.clone()])
    }

    async fn get_secret_meta(&self, _id: &SecretId) -> Result<Option<SecretRecord>, VaultError> {
        Ok(Some(self.record.clone()))
    }

    async fn get_secret_data(
        &self,
        _id: &SecretId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, VaultError> {
        sink.write_all(b"start").await.unwrap();
        std::future::pending::<()>().await;
        Ok(5)
    }

    async fn put_secret(
        &self,
        record: SecretRecord,
        _source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SecretRecord, VaultError> {
        Ok(record)
    }
}

#[tokio::test]
async fn cancellation_unblocks_a_stalled_transfer() {
    let local = Side::new(Identity::local());
    let record = SecretRecord {
        id: SecretId::from("slow"),
        revision: Revision::new(1),
        ..SecretRecord::default()
    };
    let sync = SyncService::new(
        Arc::new(StallingRemote {
            record: record.clone(),
        }),
        local.session(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sync.pull(&record, false, &cancel),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled { .. }));
    assert!(local.meta("slow").await.is_none());
    assert!(local.payloads.is_empty().await);
}

#[tokio::test]
async fn cancelled_pull_leaves_no_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let objects = FilePayloadStore::new(dir.path().join("objects"));
    let vault = VaultStore::new(
        Arc::new(KvMetaStore::new(Arc::new(MemoryBackend::new()))),
        Arc::new(objects.clone()),
    );
    let keeper = Arc::new(KeeperService::new(Arc::new(vault)));
    keeper.open().await.unwrap();

    let record = SecretRecord {
        id: SecretId::from("slow"),
        revision: Revision::new(1),
        ..SecretRecord::default()
    };
    let sync = SyncService::new(
        Arc::new(StallingRemote {
            record: record.clone(),
        }),
        Arc::new(KeeperSession::new(Arc::clone(&keeper), Identity::local())),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sync.pull(&record, false, &cancel),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled { .. }));

    let leftovers: Vec<_> = std::fs::read_dir(objects.root())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    assert!(
        keeper
            .get_secret_meta(&Identity::local(), &SecretId::from("slow"))
            .await
            .unwrap()
            .is_none()
    );
}
