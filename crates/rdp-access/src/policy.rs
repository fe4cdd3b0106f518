//! Policy decisions
//!
//! The engine is a black box answering `decide(role, resource, action)`.
//! [`Authorizer`] wraps any engine with:
//! - a bounded decision cache keyed on `(role, resource, action)`
//! - invalidation whenever the engine's rule revision moves
//! - the permission, role and role-or-self helpers used by the guard

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use rdp_types::{roles, ErrorKind, PrincipalId};

/// Default number of cached decisions
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Wildcard accepted in rule resources and actions
pub const ANY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    #[inline]
    #[must_use]
    pub fn is_allow(self) -> bool {
        self == Self::Allow
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("policy engine unavailable: {0}")]
    Unavailable(String),
}

/// A decision function over roles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn decide(&self, role: &str, resource: &str, action: &str)
        -> Result<Decision, PolicyError>;

    /// Bumped on every rule change; cached decisions older than this are discarded
    fn revision(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    resource: String,
    action: String,
}

impl Rule {
    fn matches(&self, resource: &str, action: &str) -> bool {
        (self.resource == ANY || self.resource == resource)
            && (self.action == ANY || self.action == action)
    }
}

/// In-process role table
#[derive(Debug, Default)]
pub struct RoleTable {
    rules: RwLock<HashMap<String, Vec<Rule>>>,
    revision: AtomicU64,
}

impl RoleTable {
    /// Create new empty table; every decision is deny
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with the built-in roles
    #[must_use]
    pub fn with_defaults() -> Self {
        let table = Self::new();
        table.grant(roles::ADMIN, ANY, ANY);
        for resource in ["project", "workflow", "activity", "review", "dependency"] {
            table.grant(roles::MANAGER, resource, ANY);
        }
        table.grant(roles::MANAGER, "audit-logs", "read");
        for resource in ["workflow", "activity", "review", "dependency"] {
            table.grant(roles::DESIGNER, resource, "read");
        }
        table.grant(roles::DESIGNER, "activity", "update");
        table.grant(roles::DESIGNER, "review", "create");
        table.grant(roles::DESIGNER, "review", "update");
        table.grant(roles::VIEWER, ANY, "read");
        table
    }

    pub fn grant(&self, role: &str, resource: &str, action: &str) {
        let rule = Rule {
            resource: resource.to_string(),
            action: action.to_string(),
        };
        let mut rules = self.rules.write();
        let entry = rules.entry(role.to_string()).or_default();
        if !entry.contains(&rule) {
            entry.push(rule);
        }
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns whether a rule was removed
    pub fn revoke(&self, role: &str, resource: &str, action: &str) -> bool {
        let mut rules = self.rules.write();
        let Some(entry) = rules.get_mut(role) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|rule| !(rule.resource == resource && rule.action == action));
        let removed = entry.len() != before;
        if removed {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn remove_role(&self, role: &str) -> bool {
        let removed = self.rules.write().remove(role).is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PolicyEngine for RoleTable {
    async fn decide(
        &self,
        role: &str,
        resource: &str,
        action: &str,
    ) -> Result<Decision, PolicyError> {
        let allowed = self
            .rules
            .read()
            .get(role)
            .is_some_and(|rules| rules.iter().any(|rule| rule.matches(resource, action)));
        Ok(if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        })
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

/// Why a request was refused
#[derive(Debug, Clone, thiserror::Error)]
pub enum Denial {
    #[error("access denied: no role found")]
    NoRole,

    #[error("access denied: insufficient permissions")]
    InsufficientPermission { resource: String, action: String },

    #[error("access denied: insufficient role")]
    InsufficientRole {
        required: Vec<String>,
        current: String,
    },

    #[error("error checking permissions")]
    Engine(#[from] PolicyError),
}

impl Denial {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine(_) => ErrorKind::Internal,
            _ => ErrorKind::Forbidden,
        }
    }
}

type DecisionKey = (String, String, String);

/// Cached front of a [`PolicyEngine`]
pub struct Authorizer {
    engine: Arc<dyn PolicyEngine>,
    cache: Cache<DecisionKey, Decision>,
    seen_revision: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("cached", &self.cache.entry_count())
            .field("revision", &self.seen_revision.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Authorizer {
    /// Create new authorizer with a cache of `capacity` decisions
    #[must_use]
    pub fn new(engine: Arc<dyn PolicyEngine>, capacity: u64) -> Self {
        let revision = engine.revision();
        Self {
            engine,
            cache: Cache::new(capacity),
            seen_revision: AtomicU64::new(revision),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Drop every cached decision
    pub fn rules_changed(&self) {
        self.cache.invalidate_all();
        debug!("policy cache invalidated");
    }

    fn sync_revision(&self) -> u64 {
        let current = self.engine.revision();
        if self.seen_revision.swap(current, Ordering::AcqRel) != current {
            self.rules_changed();
        }
        current
    }

    pub async fn decide(
        &self,
        role: &str,
        resource: &str,
        action: &str,
    ) -> Result<Decision, PolicyError> {
        let revision = self.sync_revision();
        let key = (role.to_string(), resource.to_string(), action.to_string());
        if let Some(decision) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(decision);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let decision = self.engine.decide(role, resource, action).await?;
        // A rule change raced this lookup; the answer may already be stale
        if self.engine.revision() == revision {
            self.cache.insert(key, decision).await;
        }
        Ok(decision)
    }

    /// `(hits, misses)` since creation
    #[must_use]
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub async fn require_permission(
        &self,
        role: Option<&str>,
        resource: &str,
        action: &str,
    ) -> Result<(), Denial> {
        let role = role.filter(|r| !r.is_empty()).ok_or(Denial::NoRole)?;
        match self.decide(role, resource, action).await {
            Ok(Decision::Allow) => Ok(()),
            Ok(Decision::Deny) => {
                debug!(role, resource, action, "permission denied");
                Err(Denial::InsufficientPermission {
                    resource: resource.to_string(),
                    action: action.to_string(),
                })
            }
            Err(err) => {
                warn!(error = %err, "policy engine failed");
                Err(err.into())
            }
        }
    }

    pub fn require_role(&self, role: Option<&str>, allowed: &[&str]) -> Result<(), Denial> {
        let role = role.filter(|r| !r.is_empty()).ok_or(Denial::NoRole)?;
        if allowed.contains(&role) {
            Ok(())
        } else {
            Err(Denial::InsufficientRole {
                required: allowed.iter().map(ToString::to_string).collect(),
                current: role.to_string(),
            })
        }
    }

    /// Pass when the caller acts on themselves or holds one of `allowed`
    pub fn require_role_or_self(
        &self,
        caller: PrincipalId,
        role: Option<&str>,
        allowed: &[&str],
        target: PrincipalId,
    ) -> Result<(), Denial> {
        if caller == target {
            return Ok(());
        }
        self.require_role(role, allowed)
    }
}
