//! Audit record extraction and the queryable audit log
//!
//! Everything here is pure field extraction so the request path spends
//! constant time building a record:
//! - classification by longest matching path prefix
//! - resource and resource id from the path or route parameters
//! - client address from proxy headers or the peer

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use rdp_types::{looks_like_id, AuditId, AuditRecord, Classification, Page, PageRequest, PrincipalId};

use crate::request::InboundRequest;
use crate::sink::{RecordWriter, WriteError};

/// Versioned API prefix stripped before taking the resource segment
pub const API_PREFIX: &str = "/api/v1/";

/// Paths that never produce an audit record
pub const SKIPPED_PATHS: &[&str] = &["/health", "/metrics"];

/// Route parameters consulted, in order, for the resource id
const ID_PARAMS: &[&str] = &["id", "user_id", "project_id"];

#[must_use]
pub fn is_skipped(path: &str) -> bool {
    SKIPPED_PATHS.contains(&path)
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Path prefix to classification table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRules {
    rules: Vec<(String, Classification)>,
    fallback: Classification,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self::empty()
            .with_rule("/health", Classification::Public)
            .with_rule("/metrics", Classification::Public)
            .with_rule("/api/v1/users", Classification::Confidential)
            .with_rule("/api/v1/auth", Classification::Confidential)
            .with_rule("/api/v1/admin", Classification::Confidential)
            .with_rule("/api/v1/audit-logs", Classification::Confidential)
            .with_rule("/api/v1/security", Classification::Secret)
    }
}

impl ClassificationRules {
    /// No rules; everything is internal
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Classification::Internal,
        }
    }

    /// Add or replace the rule for `prefix`
    #[must_use]
    pub fn with_rule(mut self, prefix: impl Into<String>, class: Classification) -> Self {
        let prefix = prefix.into();
        self.rules.retain(|(p, _)| *p != prefix);
        self.rules.push((prefix, class));
        self
    }

    /// Longest prefix ending on a segment boundary wins
    #[must_use]
    pub fn classify(&self, path: &str) -> Classification {
        self.rules
            .iter()
            .filter(|(prefix, _)| prefix_matches(path, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.fallback, |(_, class)| *class)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    let rest = path.strip_prefix(API_PREFIX).unwrap_or(path);
    rest.split('/').filter(|s| !s.is_empty())
}

/// First segment after the API prefix
#[must_use]
pub fn resource_of(path: &str) -> String {
    segments(path).next().unwrap_or_default().to_string()
}

/// Route parameter id, else an id-shaped second path segment
#[must_use]
pub fn resource_id_of(path: &str, params: &BTreeMap<String, String>) -> Option<String> {
    ID_PARAMS
        .iter()
        .find_map(|name| params.get(*name).filter(|v| !v.is_empty()).cloned())
        .or_else(|| {
            segments(path)
                .nth(1)
                .filter(|s| looks_like_id(s))
                .map(ToString::to_string)
        })
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer without port
#[must_use]
pub fn client_address(req: &InboundRequest) -> Option<String> {
    if let Some(forwarded) = req.header("x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or_default().trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    if let Some(real) = req.header("x-real-ip").map(str::trim) {
        if !real.is_empty() {
            return Some(real.to_string());
        }
    }
    req.peer.as_deref().map(strip_port)
}

fn strip_port(peer: &str) -> String {
    // [v6]:port
    if let Some(rest) = peer.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match peer.rsplit_once(':') {
        // bare v6 has more than one colon and no port
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host.to_string()
        }
        _ => peer.to_string(),
    }
}

/// Audit log query filters; all optional, all conjunctive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub principal_id: Option<PrincipalId>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub classification: Option<Classification>,
    /// Inclusive
    pub start: Option<DateTime<Utc>>,
    /// Inclusive
    pub end: Option<DateTime<Utc>>,
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.principal_id.map_or(true, |p| record.principal_id == Some(p))
            && self.action.as_ref().map_or(true, |a| record.action == *a)
            && self.resource.as_ref().map_or(true, |r| record.resource == *r)
            && self.classification.map_or(true, |c| record.classification == c)
            && self.start.map_or(true, |s| record.captured_at >= s)
            && self.end.map_or(true, |e| record.captured_at <= e)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditStoreError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the audit log
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Newest first
    async fn query(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<Page<AuditRecord>, AuditStoreError>;

    async fn get(&self, id: AuditId) -> Result<Option<AuditRecord>, AuditStoreError>;

    /// Null out the principal on every record of a deleted principal
    async fn detach_principal(&self, principal: PrincipalId) -> Result<usize, AuditStoreError>;
}

/// In-process audit log, written through the audit sink
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    rows: RwLock<BTreeMap<AuditId, AuditRecord>>,
}

impl MemoryAuditLog {
    /// Create new empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Record count per action
    #[must_use]
    pub fn actions(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for row in self.rows.read().values() {
            *counts.entry(row.action.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl RecordWriter<AuditRecord> for MemoryAuditLog {
    async fn write(&self, record: AuditRecord) -> Result<(), WriteError> {
        self.rows.write().insert(record.id, record);
        Ok(())
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn query(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<Page<AuditRecord>, AuditStoreError> {
        let matching: Vec<AuditRecord> = self
            .rows
            .read()
            .values()
            .rev()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(Page::from_ordered(matching, page))
    }

    async fn get(&self, id: AuditId) -> Result<Option<AuditRecord>, AuditStoreError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn detach_principal(&self, principal: PrincipalId) -> Result<usize, AuditStoreError> {
        let mut rows = self.rows.write();
        let mut changed = 0;
        for row in rows.values_mut() {
            if row.principal_id == Some(principal) {
                row.principal_id = None;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
