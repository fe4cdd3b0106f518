//! Session and revocation store
//!
//! One row per issued access token, keyed by the token fingerprint (hex
//! SHA-256 of the token string). Refresh tokens are not stored; they are
//! revoked through the per-principal mark that `revoke_all` sets.
//!
//! The mark is an identifier from the same monotonic generator that mints
//! token ids, so tokens issued before a `revoke_all` sort at or below it and
//! tokens issued after sort above it, even within one clock tick.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use rdp_types::{new_id, PrincipalId, Session, SessionId, SharedClock};

/// Session store failure
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Where a session was opened from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOrigin {
    pub address: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionOrigin {
    #[must_use]
    pub fn new(address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            address,
            user_agent,
        }
    }
}

/// How a fingerprint with no row is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationPolicy {
    /// Unknown tokens pass; survives a lost session table
    #[default]
    Permissive,
    /// Unknown tokens are revoked
    Strict,
}

#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    /// Idempotent on `fingerprint`; returns the stored row
    async fn record(
        &self,
        principal: PrincipalId,
        fingerprint: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        origin: &SessionOrigin,
    ) -> Result<Session, SessionError>;

    async fn is_revoked(&self, fingerprint: &str) -> Result<bool, SessionError>;

    /// Idempotent; `true` if a live row changed
    async fn revoke(&self, fingerprint: &str) -> Result<bool, SessionError>;

    /// Revoke every session of `principal`; returns how many rows changed
    async fn revoke_all(&self, principal: PrincipalId) -> Result<usize, SessionError>;

    /// Mark set by the last `revoke_all` for `principal`; token ids at or
    /// below it are revoked
    async fn revocation_mark(&self, principal: PrincipalId) -> Result<Option<Ulid>, SessionError>;

    /// Delete rows with `expires_at < now`
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, SessionError>;

    async fn touch(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<(), SessionError>;

    /// Newest first
    async fn sessions_for(&self, principal: PrincipalId) -> Result<Vec<Session>, SessionError>;
}

/// In-process session store
#[derive(Debug)]
pub struct MemorySessionStore {
    rows: DashMap<String, Session>,
    marks: DashMap<PrincipalId, Ulid>,
    policy: RevocationPolicy,
    clock: SharedClock,
}

impl MemorySessionStore {
    /// Create new permissive store
    #[inline]
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            rows: DashMap::new(),
            marks: DashMap::new(),
            policy: RevocationPolicy::default(),
            clock,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: RevocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record(
        &self,
        principal: PrincipalId,
        fingerprint: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        origin: &SessionOrigin,
    ) -> Result<Session, SessionError> {
        let row = self
            .rows
            .entry(fingerprint.to_string())
            .or_insert_with(|| Session {
                id: SessionId::new(),
                principal_id: principal,
                fingerprint: fingerprint.to_string(),
                issued_at,
                expires_at,
                last_active_at: issued_at,
                revoked: false,
                address: origin.address.clone(),
                user_agent: origin.user_agent.clone(),
            });
        Ok(row.value().clone())
    }

    async fn is_revoked(&self, fingerprint: &str) -> Result<bool, SessionError> {
        Ok(match self.rows.get(fingerprint) {
            Some(row) => row.revoked,
            None => self.policy == RevocationPolicy::Strict,
        })
    }

    async fn revoke(&self, fingerprint: &str) -> Result<bool, SessionError> {
        Ok(match self.rows.get_mut(fingerprint) {
            Some(mut row) if !row.revoked => {
                row.revoked = true;
                true
            }
            _ => false,
        })
    }

    async fn revoke_all(&self, principal: PrincipalId) -> Result<usize, SessionError> {
        self.marks.insert(principal, new_id());
        let mut changed = 0;
        for mut row in self.rows.iter_mut() {
            if row.principal_id == principal && !row.revoked {
                row.revoked = true;
                changed += 1;
            }
        }
        debug!(%principal, changed, at = %self.clock.now(), "principal sessions revoked");
        Ok(changed)
    }

    async fn revocation_mark(&self, principal: PrincipalId) -> Result<Option<Ulid>, SessionError> {
        Ok(self.marks.get(&principal).map(|mark| *mark))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let before = self.rows.len();
        self.rows.retain(|_, row| row.expires_at >= now);
        Ok(before.saturating_sub(self.rows.len()))
    }

    async fn touch(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        if let Some(mut row) = self.rows.get_mut(fingerprint) {
            if now > row.last_active_at {
                row.last_active_at = now;
            }
        }
        Ok(())
    }

    async fn sessions_for(&self, principal: PrincipalId) -> Result<Vec<Session>, SessionError> {
        let mut rows: Vec<Session> = self
            .rows
            .iter()
            .filter(|row| row.principal_id == principal)
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }
}

/// Background task that sweeps expired sessions on an interval
#[derive(Debug)]
pub struct SessionSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SessionSweeper {
    /// Start sweeping every `every`; the first sweep runs one interval after start
    #[must_use]
    pub fn spawn(store: Arc<dyn SessionStore>, clock: SharedClock, every: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => match store.sweep(clock.now()).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "expired sessions swept"),
                        Err(err) => warn!(error = %err, "session sweep failed"),
                    },
                }
            }
            debug!("session sweeper stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "session sweeper task failed");
        }
    }
}
