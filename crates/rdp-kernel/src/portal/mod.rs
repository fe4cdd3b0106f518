//! Portal wiring
//!
//! Builds every service from one [`PortalConfig`] and serves
//! [`InboundRequest`]s through the request guard:
//! - route resolution and the per-request deadline
//! - principal administration (register, role change, deactivate, delete)
//! - the session sweeper and orderly sink shutdown
//!
//! Storage seams (workflow store, session store, policy engine, audit
//! writer) default to the in-process implementations and can be replaced on
//! the [`PortalBuilder`].

mod handlers;
pub(crate) mod routes;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use rdp_access::{
    codes, ApiReply, AuditLog, AuditSink, Authorizer, InboundRequest, MemoryAuditLog,
    MemorySessionStore, MetricsBuffer, PolicyEngine, RecordWriter, RequestGuard,
    RevocationPolicy, RoleTable, SessionStore, SessionSweeper, SinkStats, TokenService,
    WriteBehind, WriteError,
};
use rdp_types::{ApiMetric, AuditRecord, Principal, PrincipalId, SharedClock, SystemClock};
use rdp_workflow::{MemoryStore, ReviewCoordinator, WorkflowEngine, WorkflowStore};

use crate::config::PortalConfig;
use crate::directory::{Directory, DirectoryError};
use crate::error::KernelResult;

/// Default API metrics writer: one debug line per call
#[derive(Debug, Default)]
struct TraceWriter;

#[async_trait]
impl RecordWriter<ApiMetric> for TraceWriter {
    async fn write(&self, record: ApiMetric) -> Result<(), WriteError> {
        debug!(
            endpoint = %record.endpoint,
            method = %record.method,
            status = record.status,
            duration_ms = record.duration_ms,
            "api call"
        );
        Ok(())
    }
}

/// Sink counters at shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub audit: SinkStats,
    pub metrics: SinkStats,
}

/// Live counters, served on the admin stats route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalStats {
    pub principals: usize,
    pub audit: SinkStats,
    pub audit_queued: usize,
    pub metrics: SinkStats,
    pub policy_cache_hits: u64,
    pub policy_cache_misses: u64,
}

/// Assembles a [`Portal`]
pub struct PortalBuilder {
    config: PortalConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn WorkflowStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    policy: Option<Arc<dyn PolicyEngine>>,
    directory: Option<Arc<Directory>>,
    audit_writer: Option<Arc<dyn RecordWriter<AuditRecord>>>,
    audit_log: Option<Arc<dyn AuditLog>>,
    metrics_writer: Option<Arc<dyn RecordWriter<ApiMetric>>>,
}

impl fmt::Debug for PortalBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PortalBuilder {
    /// Create new builder; every seam starts at its in-process default
    #[must_use]
    pub fn new(config: PortalConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            sessions: None,
            policy: None,
            directory: None,
            audit_writer: None,
            audit_log: None,
            metrics_writer: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: Arc<Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// One store serving both the audit write path and audit queries
    #[must_use]
    pub fn with_audit_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: RecordWriter<AuditRecord> + AuditLog + 'static,
    {
        self.audit_writer = Some(store.clone() as Arc<dyn RecordWriter<AuditRecord>>);
        self.audit_log = Some(store as Arc<dyn AuditLog>);
        self
    }

    /// Replace only the audit write path, keeping the query side
    #[must_use]
    pub fn with_audit_writer(mut self, writer: Arc<dyn RecordWriter<AuditRecord>>) -> Self {
        self.audit_writer = Some(writer);
        self
    }

    #[must_use]
    pub fn with_metrics_writer(mut self, writer: Arc<dyn RecordWriter<ApiMetric>>) -> Self {
        self.metrics_writer = Some(writer);
        self
    }

    /// Validate the configuration and start the sinks.
    ///
    /// Must run inside a tokio runtime: the sink writers are spawned here.
    pub fn build(self) -> KernelResult<Portal> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn WorkflowStore>);
        let sessions = self.sessions.unwrap_or_else(|| {
            let policy = if config.auth.strict_revocation {
                RevocationPolicy::Strict
            } else {
                RevocationPolicy::Permissive
            };
            let memory = MemorySessionStore::new(clock.clone()).with_policy(policy);
            Arc::new(memory) as Arc<dyn SessionStore>
        });
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(RoleTable::with_defaults()) as Arc<dyn PolicyEngine>);
        let directory = self.directory.unwrap_or_default();

        let memory_log = Arc::new(MemoryAuditLog::new());
        let audit_writer = self
            .audit_writer
            .unwrap_or_else(|| memory_log.clone() as Arc<dyn RecordWriter<AuditRecord>>);
        let audit_log = self
            .audit_log
            .unwrap_or_else(|| memory_log as Arc<dyn AuditLog>);
        let metrics_writer = self
            .metrics_writer
            .unwrap_or_else(|| Arc::new(TraceWriter) as Arc<dyn RecordWriter<ApiMetric>>);

        let tokens = Arc::new(TokenService::new(
            config.token_config(),
            sessions,
            clock.clone(),
        ));
        let authorizer = Arc::new(Authorizer::new(policy, config.policy.cache_capacity));
        let audit = Arc::new(WriteBehind::start(
            config.audit.to_sink_config("audit"),
            audit_writer,
        ));
        let metrics = Arc::new(WriteBehind::start(
            config.metrics.to_sink_config("api_metrics"),
            metrics_writer,
        ));
        let guard = RequestGuard::new(tokens.clone(), authorizer.clone(), audit.clone(), clock.clone())
            .with_metrics(metrics.clone())
            .with_rules(config.classification_rules());

        let engine = Arc::new(WorkflowEngine::new(store, clock.clone()));
        let reviews = ReviewCoordinator::new(engine.clone());

        info!(
            issuer = %config.auth.issuer,
            audit_capacity = config.audit.capacity,
            "portal ready"
        );
        Ok(Portal {
            config,
            clock,
            engine,
            reviews,
            directory,
            tokens,
            authorizer,
            audit,
            audit_log,
            metrics,
            guard,
            sweeper: Mutex::new(None),
        })
    }
}

/// The portal core behind one request entry point
pub struct Portal {
    config: PortalConfig,
    clock: SharedClock,
    engine: Arc<WorkflowEngine>,
    reviews: ReviewCoordinator,
    directory: Arc<Directory>,
    tokens: Arc<TokenService>,
    authorizer: Arc<Authorizer>,
    audit: Arc<AuditSink>,
    audit_log: Arc<dyn AuditLog>,
    metrics: Arc<MetricsBuffer>,
    guard: RequestGuard,
    sweeper: Mutex<Option<SessionSweeper>>,
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("config", &self.config)
            .field("directory", &self.directory)
            .field("audit", &self.audit.stats())
            .finish_non_exhaustive()
    }
}

impl Portal {
    #[inline]
    #[must_use]
    pub fn builder(config: PortalConfig) -> PortalBuilder {
        PortalBuilder::new(config)
    }

    /// Serve one request
    pub async fn handle(&self, req: InboundRequest) -> ApiReply {
        let Some((route, endpoint)) = routes::resolve(&req.method, req.route_path()) else {
            debug!(method = %req.method, path = req.route_path(), "no route");
            return ApiReply::error(404, codes::NOT_FOUND, "route not found");
        };
        let deadline = self.config.request_deadline();
        let pattern = route.pattern;
        self.guard
            .handle(&req, &route, |ctx| {
                let work = self.dispatch(endpoint, &route, &req, ctx);
                async move {
                    match tokio::time::timeout(deadline, work).await {
                        Ok(Ok(reply)) => reply,
                        Ok(Err(err)) => err.reply(),
                        Err(_) => {
                            warn!(route = pattern, ?deadline, "request deadline exceeded");
                            ApiReply::internal("request deadline exceeded")
                        }
                    }
                }
            })
            .await
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    #[inline]
    #[must_use]
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    #[inline]
    #[must_use]
    pub fn reviews(&self) -> &ReviewCoordinator {
        &self.reviews
    }

    #[inline]
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    #[inline]
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    #[inline]
    #[must_use]
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    #[inline]
    #[must_use]
    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.audit_log
    }

    pub fn register_principal(
        &self,
        name: &str,
        role: &str,
        password: &str,
    ) -> KernelResult<Principal> {
        Ok(self.directory.add(name, role, password)?)
    }

    /// Change a role; outstanding access tokens keep the old role until refreshed
    pub fn set_role(&self, id: PrincipalId, role: &str) -> KernelResult<Principal> {
        Ok(self.directory.set_role(id, role)?)
    }

    /// Deactivate and revoke every session; the principal is kept
    pub async fn deactivate_principal(&self, id: PrincipalId) -> KernelResult<usize> {
        self.directory.set_active(id, false)?;
        let revoked = self.tokens.revoke_all(id).await?;
        info!(principal = %id, revoked, "principal deactivated");
        Ok(revoked)
    }

    /// Remove a principal; audit rows survive with the principal cleared
    pub async fn delete_principal(&self, id: PrincipalId) -> KernelResult<usize> {
        if self.directory.get(id).is_none() {
            return Err(DirectoryError::NotFound(id.to_string()).into());
        }
        self.tokens.revoke_all(id).await?;
        let detached = self.audit_log.detach_principal(id).await?;
        self.directory.remove(id)?;
        info!(principal = %id, detached, "principal deleted");
        Ok(detached)
    }

    #[must_use]
    pub fn stats(&self) -> PortalStats {
        let (hits, misses) = self.authorizer.cache_stats();
        PortalStats {
            principals: self.directory.len(),
            audit: self.audit.stats(),
            audit_queued: self.audit.queued(),
            metrics: self.metrics.stats(),
            policy_cache_hits: hits,
            policy_cache_misses: misses,
        }
    }

    /// Start the session sweeper; a second call is a no-op
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_none() {
            *slot = Some(SessionSweeper::spawn(
                self.tokens.sessions().clone(),
                self.clock.clone(),
                self.config.session_sweep_interval(),
            ));
        }
    }

    /// Stop the sweeper and drain both sinks
    pub async fn shutdown(&self) -> ShutdownReport {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        let (audit, metrics) = futures::join!(self.audit.close(), self.metrics.close());
        info!(
            audit_written = audit.written,
            audit_dropped = audit.dropped,
            audit_failed = audit.failed,
            "portal stopped"
        );
        ShutdownReport { audit, metrics }
    }
}
