//! CLI configuration for Keeper.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Command-line flags override individual settings afterwards.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use keeper_core::cipher::Padding;
use keeper_core::model::UserId;

/// Where the vault keeps its metadata and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaBackendType {
    /// `meta.redb` and `objects/` inside the vault directory.
    Redb,
    /// Metadata and payloads both in memory. Nothing touches the vault
    /// directory and everything is gone when the process exits.
    Memory,
}

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Keeper CLI configuration.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Vault directory: holds `meta.redb` and `objects/`.
    pub data_dir: PathBuf,
    pub meta_backend: MetaBackendType,
    /// Padding mode for newly written payloads. Reading requires the mode
    /// the payload was written with.
    pub padding: Padding,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Effective user every command runs as.
    pub user_id: UserId,
}

impl KeeperConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KEEPER_DATA_DIR`: vault directory (default: `./keeper-data`)
    /// - `KEEPER_META_BACKEND`: `redb` or `memory` (default: `redb`)
    /// - `KEEPER_PADDING`: `chunk` or `final` (default: `chunk`)
    /// - `KEEPER_LOG_LEVEL`: log filter (default: `warn`)
    /// - `KEEPER_LOG_FORMAT`: `text` or `json` (default: `text`)
    /// - `KEEPER_USER`: effective user id (default: `0`, the local user)
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that cannot be
    /// parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("KEEPER_DATA_DIR")
            .map_or_else(|| PathBuf::from("./keeper-data"), PathBuf::from);

        let meta_backend = match lookup("KEEPER_META_BACKEND")
            .unwrap_or_else(|| "redb".to_owned())
            .to_lowercase()
            .as_str()
        {
            "redb" => MetaBackendType::Redb,
            "memory" => MetaBackendType::Memory,
            other => bail!("KEEPER_META_BACKEND: unknown backend '{other}' (expected redb or memory)"),
        };

        let padding = match lookup("KEEPER_PADDING") {
            Some(value) => value
                .parse::<Padding>()
                .map_err(anyhow::Error::msg)
                .context("KEEPER_PADDING")?,
            None => Padding::default(),
        };

        let log_level = lookup("KEEPER_LOG_LEVEL").unwrap_or_else(|| "warn".to_owned());

        let log_format = match lookup("KEEPER_LOG_FORMAT")
            .unwrap_or_else(|| "text".to_owned())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let user_id = match lookup("KEEPER_USER") {
            Some(value) => UserId::new(
                value
                    .parse()
                    .with_context(|| format!("KEEPER_USER: '{value}' is not a user id"))?,
            ),
            None => UserId::LOCAL,
        };

        Ok(Self {
            data_dir,
            meta_backend,
            padding,
            log_level,
            log_format,
            user_id,
        })
    }
}
