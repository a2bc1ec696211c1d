//! Caller identity.
//!
//! Every [`KeeperService`](crate::keeper::KeeperService) call takes an
//! explicit [`Identity`]. The default identity is the local user, which
//! operates on the local-only partition of the vault.

use std::fmt;

use crate::model::UserId;

/// The identity a request is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    user_id: UserId,
    login: Option<String>,
}

impl Identity {
    /// The local user: no remote identity attached.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// An authenticated user.
    #[must_use]
    pub fn user(user_id: UserId, login: impl Into<String>) -> Self {
        Self {
            user_id,
            login: Some(login.into()),
        }
    }

    /// The effective user every store call is scoped to.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.user_id.is_local()
    }
}

impl From<UserId> for Identity {
    fn from(user_id: UserId) -> Self {
        Self {
            user_id,
            login: None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.login {
            Some(login) => write!(f, "{login} ({})", self.user_id),
            None if self.is_local() => f.write_str("local"),
            None => write!(f, "user {}", self.user_id),
        }
    }
}
