//! Token-based auth gate.
//!
//! Tokens resolve to identities and identities to role sets, both built once
//! from configuration. Only SHA-256 digests of tokens are kept in memory.

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Capability required by every read endpoint.
pub const GETTER: &str = "getter";
/// Capability required by every write endpoint.
pub const SETTER: &str = "setter";

const MASTER_IDENTITY: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("`{identity}` lacks role `{role}`")]
    Forbidden { identity: String, role: String },
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: String,
    pub roles: BTreeSet<String>,
    all_roles: bool,
}

impl Principal {
    fn master() -> Self {
        Self {
            identity: MASTER_IDENTITY.to_string(),
            roles: BTreeSet::new(),
            all_roles: true,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.all_roles || self.roles.contains(role)
    }

    pub fn requires(&self, role: &str) -> Result<(), AuthError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                identity: self.identity.clone(),
                role: role.to_string(),
            })
        }
    }

    /// Roles as a comma-separated list, `*` for the master identity.
    pub fn roles_label(&self) -> String {
        if self.all_roles {
            return "*".to_string();
        }
        self.roles.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

pub struct AuthGate {
    identities: HashMap<String, String>,
    roles: HashMap<String, BTreeSet<String>>,
    master: Option<String>,
}

impl AuthGate {
    pub fn new(users: &[UserConfig], master_token: Option<&str>) -> Self {
        let mut identities = HashMap::new();
        let mut roles: HashMap<String, BTreeSet<String>> = HashMap::new();

        for user in users {
            if user.token.is_empty() {
                warn!(user = %user.name, "User without token ignored");
                continue;
            }
            if identities
                .insert(digest(&user.token), user.name.clone())
                .is_some()
            {
                warn!(user = %user.name, "Token shared with another user; last one wins");
            }
            roles
                .entry(user.name.clone())
                .or_default()
                .extend(user.roles.iter().cloned());
        }

        Self {
            identities,
            roles,
            master: master_token.filter(|token| !token.is_empty()).map(digest),
        }
    }

    pub fn user_count(&self) -> usize {
        self.roles.len()
    }

    pub fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let hashed = digest(token);
        if self.master.as_deref() == Some(hashed.as_str()) {
            return Ok(Principal::master());
        }

        let identity = self.identities.get(&hashed).ok_or(AuthError::Invalid)?;
        Ok(Principal {
            identity: identity.clone(),
            roles: self.roles.get(identity).cloned().unwrap_or_default(),
            all_roles: false,
        })
    }

    /// Authenticate `token` and require every role in `required`.
    pub fn authorize(
        &self,
        token: Option<&str>,
        required: &[&str],
    ) -> Result<Principal, AuthError> {
        let principal = self.authenticate(token.ok_or(AuthError::Missing)?)?;
        for role in required {
            principal.requires(role)?;
        }
        Ok(principal)
    }
}

fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize().to_vec())
}
