//! Request authentication
//!
//! Password checks run Argon2, which takes tens of milliseconds of CPU, so
//! they are moved to tokio's blocking pool.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, AUTHORIZATION};
use serde::Deserialize;
use tracing::debug;

use super::password::verify_password_blocking;
use super::{GroupConfig, Principal, Role, ANONYMOUS_USER};
use crate::throttling::Quota;

/// A configured user
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    pub name: String,
    /// Argon2 PHC hash; users without one can only be the anonymous user
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub quota: Option<Quota>,
}

impl UserConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            groups: BTreeSet::new(),
            quota: None,
        }
    }

    pub fn with_password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password = Some(hash.into());
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Maps a request to a principal; `None` means unauthenticated (401)
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, peer: SocketAddr, headers: &HeaderMap) -> Option<Principal>;
}

struct KnownUser {
    password: Option<String>,
    groups: BTreeSet<String>,
    roles: BTreeSet<Role>,
}

/// HTTP Basic authentication against configured users
pub struct BasicAuthenticator {
    users: HashMap<String, KnownUser>,
}

impl BasicAuthenticator {
    pub fn new(users: &[UserConfig], groups: &[GroupConfig]) -> Self {
        let group_roles: HashMap<&str, &BTreeSet<Role>> = groups
            .iter()
            .map(|group| (group.name.as_str(), &group.roles))
            .collect();
        let users = users
            .iter()
            .map(|user| {
                let roles = user
                    .groups
                    .iter()
                    .filter_map(|group| group_roles.get(group.as_str()))
                    .flat_map(|roles| roles.iter().copied())
                    .collect();
                (
                    user.name.clone(),
                    KnownUser {
                        password: user.password.clone(),
                        groups: user.groups.clone(),
                        roles,
                    },
                )
            })
            .collect();
        Self { users }
    }

    fn principal(name: &str, user: &KnownUser) -> Principal {
        Principal {
            user: Some(name.to_owned()),
            groups: user.groups.clone(),
            roles: user.roles.clone(),
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, peer: SocketAddr, headers: &HeaderMap) -> Option<Principal> {
        let Some((name, password)) = basic_credentials(headers) else {
            return self
                .users
                .get(ANONYMOUS_USER)
                .map(|user| Self::principal(ANONYMOUS_USER, user));
        };
        let user = self.users.get(&name)?;
        let verified = match &user.password {
            Some(hash) => verify_password_blocking(password, hash.clone()).await,
            None => false,
        };
        if verified {
            Some(Self::principal(&name, user))
        } else {
            debug!(%peer, user = %name, "Rejected credentials");
            None
        }
    }
}

/// Decode `Authorization: Basic base64(user:password)`
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_owned(), password.to_owned()))
}

// =============================================================================
// Tests
// =============================================================================
