//! Secret data model.
//!
//! A [`SecretRecord`] is the metadata half of a secret: identity, owner,
//! revision and a pointer (`payload_key`) to the encrypted bytes held by the
//! payload store. The payload itself never lives in this struct.
//!
//! Records compare equal when their `id` and `revision` match, regardless of
//! the other fields. That is the equality the sync protocol reasons with.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;

/// Opaque, stable identifier of a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(String);

impl SecretId {
    /// Generate a fresh id: 32 random bytes, hex-encoded.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(hex::encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the id can be stored: ids are key segments and must not
    /// contain `/`.
    pub fn is_valid(&self) -> bool {
        !self.0.contains('/')
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SecretId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identity of a vault user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    /// The local user: operation without any remote identity.
    pub const LOCAL: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Version stamp of a secret. Larger is newer.
///
/// Writers may use a logical counter or a UTC unix timestamp in seconds;
/// both encodings order correctly against themselves, and
/// [`SecretRecord::next_revision`] keeps moving forward across the two.
/// Zero means "not assigned yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    pub const UNSET: Self = Self(0);

    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Current UTC time in whole seconds.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advisory payload shape. Storage treats every kind identically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretKind {
    #[default]
    Text,
    LoginPassword,
    CreditCard,
    File,
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Text => "TEXT",
            Self::LoginPassword => "LOGIN_PASSWORD",
            Self::CreditCard => "CREDIT_CARD",
            Self::File => "FILE",
        })
    }
}

impl FromStr for SecretKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "text" => Ok(Self::Text),
            "login-password" | "login" => Ok(Self::LoginPassword),
            "credit-card" | "card" => Ok(Self::CreditCard),
            "file" => Ok(Self::File),
            other => Err(format!(
                "unknown secret kind '{other}' (expected text, login-password, credit-card or file)"
            )),
        }
    }
}

/// Metadata of one secret revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Stable id, assigned once at creation.
    pub id: SecretId,
    /// Optional human-chosen name. Not unique.
    #[serde(default)]
    pub alias: String,
    /// Owning user; [`UserId::LOCAL`] for local-only operation.
    pub owner: UserId,
    #[serde(default)]
    pub kind: SecretKind,
    /// Key of the payload object holding this revision's bytes.
    #[serde(default)]
    pub payload_key: String,
    pub revision: Revision,
    /// Soft-delete tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Free-form caller data.
    #[serde(default)]
    pub extra: String,
}

impl SecretRecord {
    /// A fresh, unsaved record of the given kind.
    #[must_use]
    pub fn new(alias: impl Into<String>, kind: SecretKind) -> Self {
        Self {
            alias: alias.into(),
            kind,
            ..Self::default()
        }
    }

    /// Whether `candidate` may replace this record: same id and a strictly
    /// greater revision.
    #[must_use]
    pub fn can_be_updated_by(&self, candidate: &Self) -> bool {
        self.id == candidate.id && candidate.revision > self.revision
    }

    /// A revision strictly greater than the current one that is also no
    /// older than the wall clock.
    #[must_use]
    pub fn next_revision(&self) -> Revision {
        Revision(self.revision.0.saturating_add(1).max(Revision::now().0))
    }

    /// The payload key this record's `(owner, id, revision)` maps to.
    #[must_use]
    pub fn derive_payload_key(&self) -> String {
        format!("{}-{}-{}", self.owner, self.id, self.revision)
    }
}

impl PartialEq for SecretRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.revision == other.revision
    }
}

impl Eq for SecretRecord {}

impl fmt::Display for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.id, self.alias, self.kind, self.revision)?;
        if self.deleted {
            f.write_str(" (deleted)")?;
        }
        Ok(())
    }
}

/// Payload shape for [`SecretKind::LoginPassword`].
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LoginPassword {
    pub login: String,
    pub password: String,
}

/// Payload shape for [`SecretKind::CreditCard`].
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CreditCard {
    pub number: String,
    pub holder: String,
    pub cvv: String,
    pub expiration: String,
}

macro_rules! json_payload {
    ($ty:ty) => {
        impl $ty {
            /// Encode as the JSON bytes stored in the payload.
            ///
            /// # Errors
            ///
            /// Returns [`VaultError::Serialization`] if encoding fails.
            pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
                serde_json::to_vec(self).map_err(|e| VaultError::Serialization {
                    reason: e.to_string(),
                })
            }

            /// Decode from payload bytes.
            ///
            /// # Errors
            ///
            /// Returns [`VaultError::Serialization`] if the bytes are not
            /// a valid encoding.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
                serde_json::from_slice(bytes).map_err(|e| VaultError::Serialization {
                    reason: e.to_string(),
                })
            }
        }
    };
}

json_payload!(LoginPassword);
json_payload!(CreditCard);

impl fmt::Debug for LoginPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginPassword")
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for CreditCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditCard")
            .field("holder", &self.holder)
            .field("number", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
