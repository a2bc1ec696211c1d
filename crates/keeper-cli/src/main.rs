//! Keeper CLI: command-line client for a local Keeper vault.
//!
//! Payloads are encrypted with the stream cipher before they reach the
//! vault and decrypted on the way out, so the vault directory only ever
//! holds ciphertext. `push` and `pull` sync against a second vault
//! directory.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use keeper_core::cipher::StreamCipher;
use keeper_core::error::SyncError;
use keeper_core::identity::Identity;
use keeper_core::keeper::KeeperService;
use keeper_core::model::{LoginPassword, SecretId, SecretKind, SecretRecord, UserId};
use keeper_core::remote::VaultRemote;
use keeper_core::store::{
    FilePayloadStore, KvMetaStore, MemoryPayloadStore, MetadataStore, PayloadStore, VaultStore,
};
use keeper_core::sync::{KeeperSession, SyncReport, SyncService};
use keeper_storage::{MemoryBackend, RedbBackend};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{KeeperConfig, LogFormat, MetaBackendType};

// ── Output styling ───────────────────────────────────────────────────

/// ANSI codes, empty when stdout is not a terminal.
struct Palette {
    reset: &'static str,
    bold: &'static str,
    dim: &'static str,
    red: &'static str,
    green: &'static str,
    yellow: &'static str,
    cyan: &'static str,
}

impl Palette {
    fn detect() -> Self {
        if std::io::stdout().is_terminal() {
            Self {
                reset: "\x1b[0m",
                bold: "\x1b[1m",
                dim: "\x1b[2m",
                red: "\x1b[31m",
                green: "\x1b[32m",
                yellow: "\x1b[33m",
                cyan: "\x1b[36m",
            }
        } else {
            Self {
                reset: "",
                bold: "",
                dim: "",
                red: "",
                green: "",
                yellow: "",
                cyan: "",
            }
        }
    }

    fn success(&self, msg: &str) {
        let Self {
            green, bold, reset, ..
        } = self;
        println!("{green}{bold}✓{reset} {msg}");
    }

    fn warning(&self, msg: &str) {
        let Self {
            yellow, bold, reset, ..
        } = self;
        println!("{yellow}{bold}⚠{reset} {yellow}{msg}{reset}");
    }

    fn kv_line(&self, key: &str, value: &str) {
        let Self { dim, reset, .. } = self;
        println!("  {dim}{key:<12}{reset} {value}");
    }
}

// ── CLI structure ────────────────────────────────────────────────────

/// Keeper: an encrypted personal secrets vault.
#[derive(Parser)]
#[command(
    name = "keeper",
    version,
    about = "Keeper CLI: store, read and sync encrypted secrets",
    long_about = None,
    after_help = "Environment variables:\n  \
         KEEPER_DATA_DIR      Vault directory (default: ./keeper-data)\n  \
         KEEPER_SECRET        Secret the payload key is derived from\n  \
         KEEPER_USER          Effective user id (default: 0, local)\n  \
         KEEPER_PADDING       chunk or final (default: chunk)\n  \
         KEEPER_META_BACKEND  redb, or memory for a throwaway vault (default: redb)\n  \
         KEEPER_LOG_LEVEL     Log filter when RUST_LOG is unset (default: warn)\n  \
         KEEPER_LOG_FORMAT    text or json\n\n\
         Examples:\n  \
         keeper put --alias wifi --line 's3cr3t'\n  \
         keeper show --alias wifi\n  \
         keeper pull --remote /mnt/shared/vault"
)]
struct Cli {
    /// Vault directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Effective user id.
    #[arg(long, global = true)]
    user: Option<u64>,

    /// Secret the payload encryption key is derived from.
    #[arg(long, env = "KEEPER_SECRET", hide_env_values = true, global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List secrets.
    Ls {
        /// Include deleted secrets.
        #[arg(long)]
        all: bool,
    },
    /// Store a secret read from FILE, --line, --login/--password or stdin.
    Put {
        /// File to read the payload from.
        file: Option<PathBuf>,
        /// Use this text as the payload.
        #[arg(long, conflicts_with = "file")]
        line: Option<String>,
        /// Human-friendly name.
        #[arg(long, default_value = "")]
        alias: String,
        /// text, login-password, credit-card or file.
        #[arg(long)]
        kind: Option<SecretKind>,
        /// Update the secret with this id instead of creating a new one.
        #[arg(long)]
        id: Option<String>,
        /// Login for a login-password secret.
        #[arg(long, requires = "password", conflicts_with_all = ["file", "line"])]
        login: Option<String>,
        /// Password for a login-password secret.
        #[arg(long, requires = "login")]
        password: Option<String>,
    },
    /// Decrypt a secret to stdout.
    Show {
        #[arg(long, conflicts_with = "alias", required_unless_present = "alias")]
        id: Option<String>,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Delete a secret.
    Rm {
        #[arg(long)]
        id: String,
        /// Remove metadata and payload instead of leaving a tombstone.
        #[arg(long)]
        purge: bool,
    },
    /// Send local secrets to another vault.
    Push(SyncArgs),
    /// Fetch secrets from another vault.
    Pull(SyncArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Directory of the other vault.
    #[arg(long)]
    remote: PathBuf,
    /// User id on the other vault (default: same as local).
    #[arg(long)]
    remote_user: Option<u64>,
    /// Sync only this secret.
    #[arg(long)]
    id: Option<String>,
    /// Overwrite even when the incoming revision is not newer.
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let palette = Palette::detect();

    match run(cli, &palette).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let Palette {
                red, bold, reset, ..
            } = palette;
            eprintln!("{red}{bold}✗ Error:{reset} {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &KeeperConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(cli: Cli, palette: &Palette) -> Result<()> {
    let mut config = KeeperConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(user) = cli.user {
        config.user_id = UserId::new(user);
    }
    init_logging(&config);

    let identity = Identity::from(config.user_id);
    let keeper = open_keeper(&config, &config.data_dir).await?;

    let secret = cli.secret.as_deref();
    let result = match cli.command {
        Commands::Ls { all } => cmd_ls(&keeper, &identity, all, palette).await,
        Commands::Put {
            file,
            line,
            alias,
            kind,
            id,
            login,
            password,
        } => {
            let payload = match (login, password) {
                (Some(login), Some(password)) => Payload::Login(LoginPassword { login, password }),
                _ => match (file, line) {
                    (Some(path), _) => Payload::File(path),
                    (None, Some(text)) => Payload::Text(text),
                    (None, None) => Payload::Stdin,
                },
            };
            let cipher = cipher(&config, secret)?;
            cmd_put(&keeper, &identity, &cipher, payload, alias, kind, id, palette).await
        }
        Commands::Show { id, alias } => {
            let cipher = cipher(&config, secret)?;
            cmd_show(&keeper, &identity, &cipher, id, alias).await
        }
        Commands::Rm { id, purge } => cmd_rm(&keeper, &identity, &id, purge, palette).await,
        Commands::Push(args) => {
            cmd_sync(&config, Arc::clone(&keeper), &identity, args, Direction::Push, palette).await
        }
        Commands::Pull(args) => {
            cmd_sync(&config, Arc::clone(&keeper), &identity, args, Direction::Pull, palette).await
        }
    };

    keeper.close().await.context("failed to close vault")?;
    result
}

fn cipher(config: &KeeperConfig, secret: Option<&str>) -> Result<StreamCipher> {
    let secret = secret.context("no secret given: pass --secret or set KEEPER_SECRET")?;
    Ok(StreamCipher::new(secret).with_padding(config.padding))
}

async fn open_keeper(config: &KeeperConfig, dir: &Path) -> Result<Arc<KeeperService>> {
    let (meta, payloads): (Arc<dyn MetadataStore>, Arc<dyn PayloadStore>) =
        match config.meta_backend {
            MetaBackendType::Redb => (
                Arc::new(KvMetaStore::new(Arc::new(RedbBackend::new(
                    dir.join("meta.redb"),
                )))),
                Arc::new(FilePayloadStore::new(dir.join("objects"))),
            ),
            MetaBackendType::Memory => (
                Arc::new(KvMetaStore::new(Arc::new(MemoryBackend::new()))),
                Arc::new(MemoryPayloadStore::new()),
            ),
        };
    let keeper = Arc::new(KeeperService::new(Arc::new(VaultStore::new(meta, payloads))));
    keeper
        .open()
        .await
        .with_context(|| format!("failed to open vault at {}", dir.display()))?;
    info!(dir = %dir.display(), backend = ?config.meta_backend, "vault opened");
    Ok(keeper)
}

// ── Commands ─────────────────────────────────────────────────────────

enum Payload {
    File(PathBuf),
    Text(String),
    Login(LoginPassword),
    Stdin,
}

async fn cmd_ls(
    keeper: &KeeperService,
    identity: &Identity,
    all: bool,
    palette: &Palette,
) -> Result<()> {
    let records = if all {
        keeper.list_all_secrets(identity).await?
    } else {
        keeper.list_secrets(identity).await?
    };
    let Palette {
        cyan, dim, yellow, reset, ..
    } = palette;
    for r in &records {
        let deleted = if r.deleted {
            format!("  {yellow}deleted{reset}")
        } else {
            String::new()
        };
        println!(
            "{cyan}{}{reset}  {:<16} {dim}{:<14} r{}{reset}{deleted}",
            r.id, r.alias, r.kind, r.revision
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_put(
    keeper: &KeeperService,
    identity: &Identity,
    cipher: &StreamCipher,
    payload: Payload,
    alias: String,
    kind: Option<SecretKind>,
    id: Option<String>,
    palette: &Palette,
) -> Result<()> {
    let kind = kind.unwrap_or(match &payload {
        Payload::Login(_) => SecretKind::LoginPassword,
        Payload::File(_) => SecretKind::File,
        Payload::Text(_) | Payload::Stdin => SecretKind::Text,
    });

    let source: Box<dyn AsyncRead + Send + Unpin> = match payload {
        Payload::File(path) => Box::new(
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        Payload::Text(text) => Box::new(std::io::Cursor::new(text.into_bytes())),
        Payload::Login(login) => Box::new(std::io::Cursor::new(login.to_bytes()?)),
        Payload::Stdin => Box::new(tokio::io::stdin()),
    };

    let mut record = SecretRecord::new(alias, kind);
    if let Some(id) = id {
        record.id = SecretId::from(id);
        if let Some(current) = keeper.get_secret_meta(identity, &record.id).await? {
            if record.alias.is_empty() {
                record.alias = current.alias;
            }
            record.extra = current.extra;
        }
    }

    let saved = keeper
        .put_secret(identity, record, cipher.encrypt_reader(source))
        .await
        .context("failed to store secret")?;

    palette.success(&format!("stored {}", saved.id));
    palette.kv_line("alias", &saved.alias);
    palette.kv_line("kind", &saved.kind.to_string());
    palette.kv_line("revision", &saved.revision.to_string());
    Ok(())
}

async fn cmd_show(
    keeper: &KeeperService,
    identity: &Identity,
    cipher: &StreamCipher,
    id: Option<String>,
    alias: Option<String>,
) -> Result<()> {
    let id = match (id, alias) {
        (Some(id), _) => SecretId::from(id),
        (None, Some(alias)) => {
            keeper
                .get_secret_meta_by_alias(identity, &alias)
                .await?
                .with_context(|| format!("no secret with alias '{alias}'"))?
                .id
        }
        (None, None) => bail!("pass --id or --alias"),
    };

    let payload = keeper
        .get_secret_data(identity, &id)
        .await?
        .with_context(|| format!("secret '{id}' not found"))?;

    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut cipher.decrypt_reader(payload), &mut stdout)
        .await
        .context("failed to decrypt secret (wrong secret or padding mode?)")?;
    stdout.flush().await?;
    Ok(())
}

async fn cmd_rm(
    keeper: &KeeperService,
    identity: &Identity,
    id: &str,
    purge: bool,
    palette: &Palette,
) -> Result<()> {
    let id = SecretId::from(id);
    if purge {
        if !keeper.purge_secret(identity, &id).await? {
            bail!("secret '{id}' not found");
        }
        palette.success(&format!("purged {id}"));
        return Ok(());
    }

    let tombstone = keeper
        .delete_secret(identity, &id)
        .await?
        .with_context(|| format!("secret '{id}' not found"))?;
    palette.success(&format!("deleted {id}"));
    palette.kv_line("revision", &tombstone.revision.to_string());
    Ok(())
}

async fn cmd_sync(
    config: &KeeperConfig,
    local: Arc<KeeperService>,
    identity: &Identity,
    args: SyncArgs,
    direction: Direction,
    palette: &Palette,
) -> Result<()> {
    let remote = open_keeper(config, &args.remote).await?;
    let remote_identity = Identity::from(args.remote_user.map_or(identity.user_id(), UserId::new));
    let sync = SyncService::new(
        Arc::new(VaultRemote::new(Arc::clone(&remote), remote_identity)),
        Arc::new(KeeperSession::new(local, identity.clone())),
    );

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let outcome = sync_with(&sync, args.id, args.force, direction, &cancel, palette).await;
    remote.close().await.context("failed to close remote vault")?;
    outcome
}

async fn sync_with(
    sync: &SyncService,
    id: Option<String>,
    force: bool,
    direction: Direction,
    cancel: &CancellationToken,
    palette: &Palette,
) -> Result<()> {
    let Some(id) = id else {
        let report = match direction {
            Direction::Push => sync.push_all(force, cancel).await?,
            Direction::Pull => sync.pull_all(force, cancel).await?,
        };
        return print_report(&report, palette);
    };

    let id = SecretId::from(id);
    let outcome = match direction {
        Direction::Push => sync.push_by_id(&id, force, cancel).await,
        Direction::Pull => sync.pull_by_id(&id, force, cancel).await,
    };
    match outcome {
        Ok(record) => {
            palette.success(&format!("synced {}", record.id));
            palette.kv_line("revision", &record.revision.to_string());
            Ok(())
        }
        Err(SyncError::NothingToUpdate { .. }) => {
            palette.success(&format!("{id} is already up to date"));
            Ok(())
        }
        Err(e @ SyncError::ConflictVersion { .. }) => {
            Err(anyhow::Error::new(e).context("use --force to overwrite"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &SyncReport, palette: &Palette) -> Result<()> {
    for id in &report.conflicts {
        palette.warning(&format!("conflict on {id}, skipped (use --force to overwrite)"));
    }
    for failure in &report.failed {
        palette.warning(&format!("{}: {}", failure.id, failure.error));
    }
    palette.success(&report.to_string());
    if report.cancelled {
        bail!("sync cancelled");
    }
    if !report.failed.is_empty() {
        bail!("{} secrets failed to sync", report.failed.len());
    }
    Ok(())
}
