//! Principal directory
//!
//! Who can log in: name, role, active flag and a salted SHA-256 password
//! digest. Token refresh reads the directory through [`PrincipalLookup`], so
//! a role change lands in the next access token without re-login.

use std::fmt;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::info;

use rdp_access::{LookupError, PrincipalLookup};
use rdp_types::{roles, ErrorKind, Principal, PrincipalId};

const SALT_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("principal name {0:?} is already taken")]
    Duplicate(String),

    #[error("principal {0} not found")]
    NotFound(String),

    #[error("invalid principal: {0}")]
    Validation(String),
}

impl DirectoryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Duplicate(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Clone)]
struct Credential {
    principal: Principal,
    salt: [u8; SALT_LEN],
    digest: [u8; 32],
}

fn digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn same(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn check_role(role: &str) -> Result<(), DirectoryError> {
    if roles::ALL.contains(&role) {
        Ok(())
    } else {
        Err(DirectoryError::Validation(format!("unknown role {role:?}")))
    }
}

/// In-process principal directory
#[derive(Default)]
pub struct Directory {
    entries: DashMap<PrincipalId, Credential>,
    names: DashMap<String, PrincipalId>,
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("principals", &self.entries.len())
            .finish()
    }
}

impl Directory {
    /// Create new empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active principal
    pub fn add(&self, name: &str, role: &str, password: &str) -> Result<Principal, DirectoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DirectoryError::Validation("name must not be empty".into()));
        }
        if password.is_empty() {
            return Err(DirectoryError::Validation("password must not be empty".into()));
        }
        check_role(role)?;

        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DirectoryError::Duplicate(name.to_string())),
            Entry::Vacant(slot) => {
                let principal = Principal::new(name, role);
                let salt: [u8; SALT_LEN] = rand::random();
                self.entries.insert(
                    principal.id,
                    Credential {
                        principal: principal.clone(),
                        salt,
                        digest: digest(&salt, password),
                    },
                );
                slot.insert(principal.id);
                info!(principal = %principal.id, role, "principal registered");
                Ok(principal)
            }
        }
    }

    /// Check a name/password pair; inactive principals never authenticate
    #[must_use]
    pub fn authenticate(&self, name: &str, password: &str) -> Option<Principal> {
        let id = *self.names.get(name.trim())?;
        let entry = self.entries.get(&id)?;
        let matches = same(&digest(&entry.salt, password), &entry.digest);
        (matches && entry.principal.active).then(|| entry.principal.clone())
    }

    #[must_use]
    pub fn get(&self, id: PrincipalId) -> Option<Principal> {
        self.entries.get(&id).map(|e| e.principal.clone())
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Principal> {
        let id = *self.names.get(name)?;
        self.get(id)
    }

    /// Every principal, in registration order
    #[must_use]
    pub fn list(&self) -> Vec<Principal> {
        let mut all: Vec<Principal> = self.entries.iter().map(|e| e.principal.clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_role(&self, id: PrincipalId, role: &str) -> Result<Principal, DirectoryError> {
        check_role(role)?;
        let principal = self.update(id, |p| p.role = role.to_string())?;
        info!(principal = %id, role, "role changed");
        Ok(principal)
    }

    pub fn set_active(&self, id: PrincipalId, active: bool) -> Result<Principal, DirectoryError> {
        self.update(id, |p| p.active = active)
    }

    pub fn remove(&self, id: PrincipalId) -> Result<Principal, DirectoryError> {
        let (_, entry) = self
            .entries
            .remove(&id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        self.names.remove(&entry.principal.name);
        info!(principal = %id, "principal removed");
        Ok(entry.principal)
    }

    fn update<F>(&self, id: PrincipalId, change: F) -> Result<Principal, DirectoryError>
    where
        F: FnOnce(&mut Principal),
    {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        change(&mut entry.principal);
        Ok(entry.principal.clone())
    }
}

#[async_trait]
impl PrincipalLookup for Directory {
    async fn lookup(&self, id: PrincipalId) -> Result<Option<Principal>, LookupError> {
        Ok(self.get(id))
    }
}
