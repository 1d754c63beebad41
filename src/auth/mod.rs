//! Authentication and Authorization
//!
//! Requests are first mapped to a [`Principal`] by an [`Authenticator`],
//! then checked against the method's required role by an [`Authorizer`].
//!
//! ```text
//! headers ──► Authenticator ──► Principal { user, groups, roles }
//!                 │ none                       │
//!                 ▼                            ▼
//!               401            Authorizer(roles, method) ──► 403 / pass
//! ```

pub mod authenticator;
pub mod authorizer;
pub mod password;

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;

pub use authenticator::{Authenticator, BasicAuthenticator, UserConfig};
pub use authorizer::{Authorizer, RoleAuthorizer};

/// Name of the user requests fall back to when they carry no credentials
pub const ANONYMOUS_USER: &str = "";

/// Capability granted through group membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// GET and HEAD
    Reader,
    /// PUT and POST
    Writer,
    /// TRACE
    Healthcheck,
}

impl Role {
    pub fn all() -> BTreeSet<Role> {
        [Role::Reader, Role::Writer, Role::Healthcheck]
            .into_iter()
            .collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Healthcheck => "healthcheck",
        };
        f.write_str(name)
    }
}

/// A group of users sharing roles and quotas
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    /// Quota shared by all members together
    #[serde(default)]
    pub group_quota: Option<crate::throttling::Quota>,
    /// Quota applied to each member without a quota of its own
    #[serde(default)]
    pub user_quota: Option<crate::throttling::Quota>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            name: name.into(),
            roles: roles.into_iter().collect(),
            group_quota: None,
            user_quota: None,
        }
    }
}

/// Identity attached to a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// Authenticated user name; `Some("")` for the configured anonymous user
    pub user: Option<String>,
    pub groups: BTreeSet<String>,
    pub roles: BTreeSet<Role>,
}

impl Principal {
    /// Principal used when authentication is disabled
    pub fn unauthenticated() -> Self {
        Self {
            user: None,
            groups: BTreeSet::new(),
            roles: Role::all(),
        }
    }

    /// True unless a named (non-anonymous) user was authenticated
    pub fn is_anonymous(&self) -> bool {
        self.user.as_deref().map_or(true, str::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_deserialize_lowercase() {
        let roles: BTreeSet<Role> = serde_yaml::from_str("[reader, healthcheck]").unwrap();
        assert!(roles.contains(&Role::Reader));
        assert!(roles.contains(&Role::Healthcheck));
        assert!(!roles.contains(&Role::Writer));
    }

    #[test]
    fn test_anonymous_principals() {
        assert!(Principal::unauthenticated().is_anonymous());
        let anonymous = Principal {
            user: Some(ANONYMOUS_USER.into()),
            ..Default::default()
        };
        assert!(anonymous.is_anonymous());
        let named = Principal {
            user: Some("ci".into()),
            ..Default::default()
        };
        assert!(!named.is_anonymous());
    }
}
