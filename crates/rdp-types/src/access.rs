//! Principals, sessions, audit records and API metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AuditId, PrincipalId, SessionId};
use crate::label::labelled_enum;

/// Built-in role names
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const MANAGER: &str = "manager";
    pub const DESIGNER: &str = "designer";
    pub const VIEWER: &str = "viewer";

    /// Role given to principals created without one
    pub const DEFAULT: &str = DESIGNER;

    /// All built-in roles
    pub const ALL: &[&str] = &[ADMIN, MANAGER, DESIGNER, VIEWER];
}

/// An authenticated party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub name: String,
    pub role: String,
    /// Deactivated principals cannot log in or refresh
    pub active: bool,
}

impl Principal {
    /// Create new active principal
    #[must_use]
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(),
            name: name.into(),
            role: role.into(),
            active: true,
        }
    }
}

/// Server-side record of an issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub principal_id: PrincipalId,
    /// Hex SHA-256 of the token; the raw token is never stored
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub revoked: bool,
    pub address: Option<String>,
    pub user_agent: Option<String>,
}

impl Session {
    /// Whether the session is past its expiry at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

labelled_enum! {
    /// Sensitivity of a request path
    Classification ("classification") {
        Public => "public",
        Internal => "internal",
        Confidential => "confidential",
        Secret => "secret",
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::Internal
    }
}

/// One audited request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditId,
    /// `None` for unauthenticated requests or deleted principals
    pub principal_id: Option<PrincipalId>,
    pub principal_name: Option<String>,
    pub address: Option<String>,
    pub user_agent: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub path: String,
    pub response_code: u16,
    pub classification: Classification,
    pub captured_at: DateTime<Utc>,
}

/// Timing sample for one API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMetric {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub duration_ms: u64,
    pub status: u16,
    pub principal_id: Option<PrincipalId>,
    pub address: Option<String>,
}
