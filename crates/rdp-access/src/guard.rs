//! Request guard
//!
//! Runs one request through the authenticated-request contract:
//! 1. bearer extraction (4010 missing, 4011 bad format)
//! 2. token verification (4016 expired, 4017 revoked, 4012 otherwise)
//! 3. route access check (403 with the required resource/action or roles)
//! 4. the handler
//! 5. audit and timing records, built after the status is known
//!
//! Rejected requests are audited too; a token rejection leaves the principal empty.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument};

use rdp_types::{ApiMetric, AuditId, AuditRecord, PrincipalId, SharedClock};

use crate::audit::{client_address, is_skipped, resource_id_of, resource_of, ClassificationRules};
use crate::policy::{Authorizer, Denial};
use crate::request::{codes, ApiReply, InboundRequest};
use crate::sink::{AuditSink, MetricsBuffer};
use crate::token::{fingerprint, TokenError, TokenService};

/// What a route demands of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No token needed
    Public,
    /// Any valid access token
    Authenticated,
    /// Policy decision on `(role, resource, action)`
    Permission {
        resource: &'static str,
        action: &'static str,
    },
    /// Role must be one of these
    Roles(&'static [&'static str]),
    /// Caller is `target`, or holds one of `roles`
    RoleOrSelf {
        roles: &'static [&'static str],
        target: PrincipalId,
    },
}

impl Access {
    /// Audit action: the policy action when gated, else the method
    fn action<'a>(&'a self, method: &'a str) -> &'a str {
        match self {
            Self::Permission { action, .. } => *action,
            _ => method,
        }
    }
}

/// A request matched against the route table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Route template, e.g. `/api/v1/workflows/:id`
    pub pattern: &'static str,
    pub access: Access,
    pub params: BTreeMap<String, String>,
}

impl RouteMatch {
    #[must_use]
    pub fn new(pattern: &'static str, access: Access) -> Self {
        Self {
            pattern,
            access,
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PrincipalId,
    pub name: Option<String>,
    pub role: Option<String>,
}

/// What a handler learns about its caller
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identity: Option<Identity>,
    /// Presented bearer token
    pub token: Option<String>,
    pub address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Fingerprint of the presented token
    #[must_use]
    pub fn session_fingerprint(&self) -> Option<String> {
        self.token.as_deref().map(fingerprint)
    }

    #[must_use]
    pub fn principal_id(&self) -> Option<PrincipalId> {
        self.identity.as_ref().map(|i| i.id)
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|i| i.role.as_deref())
    }
}

/// Reply for a token failure
#[must_use]
pub fn token_reply(err: &TokenError) -> ApiReply {
    let status = err.kind().http_status();
    ApiReply::error(status, err.code(), err.public_message())
}

/// Reply for a policy refusal
#[must_use]
pub fn denial_reply(denial: &Denial) -> ApiReply {
    match denial {
        Denial::NoRole => ApiReply::error(403, codes::NO_ROLE, denial.to_string()),
        Denial::InsufficientPermission { resource, action } => {
            ApiReply::error(403, codes::INSUFFICIENT_PERMISSION, denial.to_string())
                .with_data(json!({ "required": { "resource": resource, "action": action } }))
        }
        Denial::InsufficientRole { required, current } => {
            ApiReply::error(403, codes::INSUFFICIENT_ROLE, denial.to_string())
                .with_data(json!({ "required_roles": required, "current_role": current }))
        }
        Denial::Engine(_) => ApiReply::internal(denial.to_string()),
    }
}

fn bearer(req: &InboundRequest) -> Result<String, ApiReply> {
    let header = req.header("authorization").ok_or_else(|| {
        ApiReply::error(401, codes::MISSING_AUTHORIZATION, "authorization header required")
    })?;
    match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim().to_string())
        }
        _ => Err(ApiReply::error(
            401,
            codes::BAD_AUTHORIZATION_FORMAT,
            "invalid authorization header format",
        )),
    }
}

/// Wraps handlers with authentication, authorization, audit and timing
#[derive(Debug, Clone)]
pub struct RequestGuard {
    tokens: Arc<TokenService>,
    authorizer: Arc<Authorizer>,
    audit: Arc<AuditSink>,
    metrics: Option<Arc<MetricsBuffer>>,
    rules: ClassificationRules,
    clock: SharedClock,
}

impl RequestGuard {
    /// Create new guard with the default classification rules
    #[must_use]
    pub fn new(
        tokens: Arc<TokenService>,
        authorizer: Arc<Authorizer>,
        audit: Arc<AuditSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            tokens,
            authorizer,
            audit,
            metrics: None,
            rules: ClassificationRules::default(),
            clock,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsBuffer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: ClassificationRules) -> Self {
        self.rules = rules;
        self
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

    async fn admit(
        &self,
        req: &InboundRequest,
        access: Access,
        ctx: &mut RequestContext,
    ) -> Result<(), ApiReply> {
        if access == Access::Public {
            return Ok(());
        }
        let token = bearer(req)?;
        let claims = self.tokens.verify_access(&token).await.map_err(|err| {
            debug!(error = %err, "token rejected");
            token_reply(&err)
        })?;
        let id = claims.principal().map_err(|err| token_reply(&err))?;
        let identity = Identity {
            id,
            name: claims.name,
            role: claims.role,
        };
        let role = identity.role.clone();
        ctx.identity = Some(identity);
        ctx.token = Some(token);

        let role = role.as_deref();
        let decided = match access {
            Access::Public | Access::Authenticated => Ok(()),
            Access::Permission { resource, action } => {
                self.authorizer.require_permission(role, resource, action).await
            }
            Access::Roles(roles) => self.authorizer.require_role(role, roles),
            Access::RoleOrSelf { roles, target } => {
                self.authorizer.require_role_or_self(id, role, roles, target)
            }
        };
        decided.map_err(|denial| denial_reply(&denial))
    }

    /// Run `handler` behind the access check for `route`
    #[instrument(skip_all, fields(method = %req.method, route = route.pattern))]
    pub async fn handle<F, Fut>(
        &self,
        req: &InboundRequest,
        route: &RouteMatch,
        handler: F,
    ) -> ApiReply
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = ApiReply>,
    {
        let started = tokio::time::Instant::now();
        let mut ctx = RequestContext {
            address: client_address(req),
            user_agent: req.header("user-agent").map(ToString::to_string),
            ..RequestContext::default()
        };
        let reply = match self.admit(req, route.access, &mut ctx).await {
            Ok(()) => handler(ctx.clone()).await,
            Err(reply) => reply,
        };
        let elapsed = started.elapsed();
        debug!(status = reply.status, ?elapsed, "request finished");
        self.record(req, route, &ctx, &reply, elapsed);
        reply
    }

    fn record(
        &self,
        req: &InboundRequest,
        route: &RouteMatch,
        ctx: &RequestContext,
        reply: &ApiReply,
        elapsed: std::time::Duration,
    ) {
        let path = req.route_path();
        let now = self.clock.now();
        if !is_skipped(path) {
            self.audit.offer(AuditRecord {
                id: AuditId::new(),
                principal_id: ctx.principal_id(),
                principal_name: ctx.identity.as_ref().and_then(|i| i.name.clone()),
                address: ctx.address.clone(),
                user_agent: ctx.user_agent.clone(),
                action: route.access.action(&req.method).to_string(),
                resource: resource_of(path),
                resource_id: resource_id_of(path, &route.params),
                method: req.method.clone(),
                path: path.to_string(),
                response_code: reply.status,
                classification: self.rules.classify(path),
                captured_at: now,
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.offer(ApiMetric {
                timestamp: now,
                endpoint: route.pattern.to_string(),
                method: req.method.clone(),
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                status: reply.status,
                principal_id: ctx.principal_id(),
                address: ctx.address.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::policy::RoleTable;
    use crate::session::MemorySessionStore;
    use crate::sink::{MemoryWriter, SinkConfig, WriteBehind};
    use crate::token::TokenConfig;
    use rdp_types::{roles, Classification, ManualClock};

    struct Fixture {
        guard: RequestGuard,
        log: Arc<MemoryAuditLog>,
        timings: Arc<MemoryWriter<ApiMetric>>,
        audit: Arc<AuditSink>,
        metrics: Arc<MetricsBuffer>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let tokens = Arc::new(TokenService::new(
            TokenConfig::new("0123456789abcdef0123456789abcdef"),
            Arc::new(MemorySessionStore::new(clock.clone())),
            clock.clone(),
        ));
        let authorizer = Arc::new(Authorizer::new(Arc::new(RoleTable::with_defaults()), 100));
        let log = Arc::new(MemoryAuditLog::new());
        let timings = Arc::new(MemoryWriter::new());
        let audit = Arc::new(WriteBehind::start(SinkConfig::new("audit"), log.clone()));
        let metrics = Arc::new(WriteBehind::start(SinkConfig::new("api_metrics"), timings.clone()));
        let guard = RequestGuard::new(tokens, authorizer, audit.clone(), clock)
            .with_metrics(metrics.clone());
        Fixture {
            guard,
            log,
            timings,
            audit,
            metrics,
        }
    }

    async fn ok(_: RequestContext) -> ApiReply {
        ApiReply::ok(&"done")
    }

    #[tokio::test]
    async fn missing_and_malformed_headers() {
        let f = fixture();
        let route = RouteMatch::new("/api/v1/workflows", Access::Authenticated);

        let reply = f.guard.handle(&InboundRequest::get("/api/v1/workflows"), &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (401, 4010));

        let req = InboundRequest::get("/api/v1/workflows").with_header("Authorization", "Token abc");
        let reply = f.guard.handle(&req, &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (401, 4011));

        let req = InboundRequest::get("/api/v1/workflows").with_bearer("not-a-jwt");
        let reply = f.guard.handle(&req, &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (401, 4012));

        f.audit.close().await;
        assert_eq!(f.log.len(), 3);
        let page = crate::audit::AuditLog::query(&*f.log, &Default::default(), Default::default())
            .await
            .unwrap();
        assert!(page.items.iter().all(|r| r.principal_id.is_none() && r.response_code == 401));
    }

    #[tokio::test]
    async fn permission_denial_carries_requirement() {
        let f = fixture();
        let pair = f
            .guard
            .tokens()
            .mint_pair(PrincipalId::new(), "vic", roles::VIEWER)
            .await
            .unwrap();
        let route = RouteMatch::new(
            "/api/v1/workflows",
            Access::Permission {
                resource: "workflow",
                action: "create",
            },
        );
        let req = InboundRequest::post("/api/v1/workflows").with_bearer(&pair.access_token);
        let reply = f.guard.handle(&req, &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (403, 4031));
        assert_eq!(
            reply.envelope.data,
            json!({"required": {"resource": "workflow", "action": "create"}})
        );
    }

    #[tokio::test]
    async fn role_denial_lists_roles() {
        let f = fixture();
        let pair = f
            .guard
            .tokens()
            .mint_pair(PrincipalId::new(), "dee", roles::DESIGNER)
            .await
            .unwrap();
        let route = RouteMatch::new("/api/v1/admin/stats", Access::Roles(&[roles::ADMIN]));
        let req = InboundRequest::get("/api/v1/admin/stats").with_bearer(&pair.access_token);
        let reply = f.guard.handle(&req, &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (403, 4032));
        assert_eq!(reply.envelope.data["current_role"], "designer");
    }

    #[tokio::test]
    async fn allowed_request_is_audited_once_after_status() {
        let f = fixture();
        let who = PrincipalId::new();
        let pair = f.guard.tokens().mint_pair(who, "ada", roles::MANAGER).await.unwrap();
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let route = RouteMatch::new(
            "/api/v1/workflows/:id",
            Access::Permission {
                resource: "workflow",
                action: "read",
            },
        )
        .with_param("id", id);
        let req = InboundRequest::get(format!("/api/v1/workflows/{id}"))
            .with_bearer(&pair.access_token)
            .with_header("X-Forwarded-For", "198.51.100.4")
            .with_header("User-Agent", "probe/1.0");

        let reply = f
            .guard
            .handle(&req, &route, |ctx| async move {
                assert_eq!(ctx.principal_id(), Some(who));
                ApiReply::error(404, codes::NOT_FOUND, "workflow not found")
            })
            .await;
        assert_eq!(reply.status, 404);

        f.audit.close().await;
        f.metrics.close().await;
        let page = crate::audit::AuditLog::query(&*f.log, &Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let row = &page.items[0];
        assert_eq!(row.principal_id, Some(who));
        assert_eq!(row.principal_name.as_deref(), Some("ada"));
        assert_eq!(row.action, "read");
        assert_eq!(row.method, "GET");
        assert_eq!(row.resource, "workflows");
        assert_eq!(row.resource_id.as_deref(), Some(id));
        assert_eq!(row.response_code, 404);
        assert_eq!(row.address.as_deref(), Some("198.51.100.4"));
        assert_eq!(row.user_agent.as_deref(), Some("probe/1.0"));
        assert_eq!(row.classification, Classification::Internal);

        let timings = f.timings.records();
        assert_eq!(timings.len(), 1);
        assert_eq!(timings[0].endpoint, "/api/v1/workflows/:id");
        assert_eq!(timings[0].status, 404);
    }

    #[tokio::test]
    async fn health_is_not_audited() {
        let f = fixture();
        let route = RouteMatch::new("/health", Access::Public);
        let reply = f.guard.handle(&InboundRequest::get("/health"), &route, ok).await;
        assert_eq!(reply.status, 200);
        f.audit.close().await;
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn revoked_token_gets_its_own_code() {
        let f = fixture();
        let pair = f
            .guard
            .tokens()
            .mint_pair(PrincipalId::new(), "a", roles::ADMIN)
            .await
            .unwrap();
        f.guard.tokens().revoke(&pair.access_token).await.unwrap();
        let route = RouteMatch::new("/api/v1/workflows", Access::Authenticated);
        let req = InboundRequest::get("/api/v1/workflows").with_bearer(&pair.access_token);
        let reply = f.guard.handle(&req, &route, ok).await;
        assert_eq!((reply.status, reply.envelope.code), (401, 4017));
        assert_eq!(reply.envelope.message, "invalid or expired token");
    }
}
