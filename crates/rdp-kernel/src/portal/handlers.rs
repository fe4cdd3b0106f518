//! Endpoint handlers
//!
//! Each handler runs after the guard has admitted the caller. Bodies decode
//! into the request structs below; path ids are parsed here so a malformed id
//! is a 400, never a lookup.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use rdp_access::{
    AuditFilter, ApiReply, InboundRequest, RequestContext, RouteMatch, SessionOrigin, TokenPair,
};
use rdp_types::{
    roles, ActivityId, ActivityType, AuditId, DependencyId, DependencyType, NewActivity,
    NewReview, NewWorkflow, PageRequest, Principal, PrincipalId, ProjectId, ReviewId, ReviewType,
    TemplateId, WorkflowId, WorkflowState,
};
use rdp_workflow::WorkflowFilter;

use super::routes::{ActivityOp, Endpoint, Verdict};
use super::Portal;
use crate::directory::DirectoryError;
use crate::error::{KernelError, KernelResult};

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct LoginReply<'a> {
    #[serde(flatten)]
    pair: &'a TokenPair,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a Principal>,
}

fn default_role() -> String {
    roles::DEFAULT.to_string()
}

#[derive(Debug, Deserialize)]
struct CreateUserBody {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: String,
}

#[derive(Debug, Deserialize)]
struct RoleBody {
    role: String,
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowBody {
    project_id: ProjectId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    template_id: Option<TemplateId>,
}

#[derive(Debug, Deserialize)]
struct TransitionBody {
    state: WorkflowState,
}

#[derive(Debug, Deserialize)]
struct CreateActivityBody {
    name: String,
    activity_type: ActivityType,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parent_id: Option<ActivityId>,
    #[serde(default)]
    sequence: i32,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    assignee_id: Option<PrincipalId>,
    #[serde(default)]
    planned_start: Option<DateTime<Utc>>,
    #[serde(default)]
    planned_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    progress: u32,
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    assignee_id: Option<PrincipalId>,
}

#[derive(Debug, Deserialize)]
struct DependencyBody {
    depends_on_id: ActivityId,
    #[serde(default)]
    dependency_type: DependencyType,
}

#[derive(Debug, Deserialize)]
struct OpenReviewBody {
    review_type: ReviewType,
    #[serde(default)]
    reviewer_id: Option<PrincipalId>,
    #[serde(default)]
    comments: String,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default)]
    comments: String,
    #[serde(default)]
    score: Option<u32>,
}

fn ok<T: Serialize>(data: &T) -> KernelResult<ApiReply> {
    Ok(ApiReply::ok(data))
}

fn path_id<T: FromStr>(route: &RouteMatch, what: &str) -> KernelResult<T> {
    let raw = route.param("id").unwrap_or_default();
    raw.parse()
        .map_err(|_| KernelError::Validation(format!("invalid {what} id {raw:?}")))
}

fn body<T: DeserializeOwned>(req: &InboundRequest) -> KernelResult<T> {
    req.json()
        .map_err(|reply| KernelError::InvalidBody(reply.envelope.message))
}

fn caller(ctx: &RequestContext) -> KernelResult<PrincipalId> {
    ctx.principal_id()
        .ok_or_else(|| KernelError::Unexpected("admitted request without identity".into()))
}

fn origin(ctx: &RequestContext) -> SessionOrigin {
    SessionOrigin::new(ctx.address.clone(), ctx.user_agent.clone())
}

/// Empty values count as absent
fn query_value<T>(query: &BTreeMap<String, String>, key: &str) -> KernelResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match query.get(key).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err| KernelError::Validation(format!("invalid {key}: {err}"))),
    }
}

/// Out-of-range or unparsable values fall back to the defaults
fn page_of(query: &BTreeMap<String, String>) -> PageRequest {
    let defaults = PageRequest::default();
    let page = query
        .get("page")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(defaults.page);
    let page_size = query
        .get("page_size")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(defaults.page_size);
    PageRequest::new(page, page_size)
}

/// `YYYY-MM-DD` or RFC 3339; a bare end date covers the whole day
fn date_bound(raw: &str, end_of_day: bool) -> KernelResult<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| KernelError::Validation(format!("invalid date {raw:?}")))?;
    let time = if end_of_day {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| KernelError::Validation(format!("invalid date {raw:?}")))
}

fn audit_filter(query: &BTreeMap<String, String>) -> KernelResult<AuditFilter> {
    let principal_key = if query.contains_key("principal_id") {
        "principal_id"
    } else {
        "user_id"
    };
    let text = |key: &str| query.get(key).filter(|v| !v.is_empty()).cloned();
    Ok(AuditFilter {
        principal_id: query_value(query, principal_key)?,
        action: text("action"),
        resource: text("resource"),
        classification: query_value(query, "classification")?,
        start: text("start_date")
            .map(|raw| date_bound(&raw, false))
            .transpose()?,
        end: text("end_date").map(|raw| date_bound(&raw, true)).transpose()?,
    })
}

impl Portal {
    pub(super) async fn dispatch(
        &self,
        endpoint: Endpoint,
        route: &RouteMatch,
        req: &InboundRequest,
        ctx: RequestContext,
    ) -> KernelResult<ApiReply> {
        use Endpoint as E;

        match endpoint {
            E::Health => ok(&json!({ "status": "ok", "version": crate::VERSION })),

            E::Login => self.login(req, &ctx).await,
            E::Refresh => self.refresh(req, &ctx).await,
            E::Logout => {
                let token = ctx.token.as_deref().unwrap_or_default();
                let revoked = self.tokens.revoke(token).await?;
                ok(&json!({ "message": "logged out successfully", "revoked": revoked }))
            }
            E::Me => {
                let id = caller(&ctx)?;
                let me = self
                    .directory
                    .get(id)
                    .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
                ok(&me)
            }
            E::MySessions => {
                let sessions = self.tokens.sessions().sessions_for(caller(&ctx)?).await?;
                ok(&sessions)
            }

            E::AuditQuery => {
                let query = req.query();
                let filter = audit_filter(&query)?;
                let page = self.audit_log.query(&filter, page_of(&query)).await?;
                ok(&page)
            }
            E::AuditGet => {
                let id: AuditId = path_id(route, "audit log")?;
                let record = self
                    .audit_log
                    .get(id)
                    .await?
                    .ok_or_else(|| KernelError::NotFound(format!("audit log {id}")))?;
                ok(&record)
            }

            E::CreateUser => {
                let input: CreateUserBody = body(req)?;
                let principal =
                    self.register_principal(&input.username, &input.role, &input.password)?;
                ok(&principal)
            }
            E::GetUser => {
                let id: PrincipalId = path_id(route, "principal")?;
                let principal = self
                    .directory
                    .get(id)
                    .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
                ok(&principal)
            }
            E::SetRole => {
                let id = path_id(route, "principal")?;
                let input: RoleBody = body(req)?;
                ok(&self.set_role(id, &input.role)?)
            }
            E::DeactivateUser => {
                let id = path_id(route, "principal")?;
                let revoked = self.deactivate_principal(id).await?;
                ok(&json!({ "principal_id": id, "revoked_sessions": revoked }))
            }
            E::DeleteUser => {
                let id = path_id(route, "principal")?;
                let detached = self.delete_principal(id).await?;
                ok(&json!({ "principal_id": id, "detached_audit_records": detached }))
            }
            E::AdminStats => ok(&self.stats()),

            E::ListWorkflows => {
                let query = req.query();
                let filter = WorkflowFilter {
                    project_id: query_value(&query, "project_id")?,
                    state: query_value(&query, "state")?,
                };
                ok(&self.engine.list_workflows(filter, page_of(&query)).await?)
            }
            E::CreateWorkflow => {
                let input: CreateWorkflowBody = body(req)?;
                let workflow = self
                    .engine
                    .create_workflow(NewWorkflow {
                        project_id: input.project_id,
                        template_id: input.template_id,
                        name: input.name,
                        description: input.description,
                        creator_id: caller(&ctx)?,
                    })
                    .await?;
                ok(&workflow)
            }
            E::GetWorkflow => ok(&self.engine.workflow(path_id(route, "workflow")?).await?),
            E::DeleteWorkflow => {
                ok(&self.engine.delete_workflow(path_id(route, "workflow")?).await?)
            }
            E::TransitionWorkflow => {
                let id = path_id(route, "workflow")?;
                let input: TransitionBody = body(req)?;
                ok(&self.engine.transition_workflow(id, input.state).await?)
            }
            E::WorkflowTransitions => {
                let id: WorkflowId = path_id(route, "workflow")?;
                let current = self.engine.workflow(id).await?.state;
                let available = self.engine.available_transitions(id).await?;
                ok(&json!({ "current": current, "available": available }))
            }
            E::WorkflowProgress => ok(&self.engine.progress(path_id(route, "workflow")?).await?),
            E::WorkflowGraph => {
                let id: WorkflowId = path_id(route, "workflow")?;
                self.engine.workflow(id).await?;
                let graph = self.engine.dependency_graph(id).await?;
                ok(&json!({ "edges": graph.edge_count(), "order": graph.execution_order() }))
            }
            E::ListActivities => {
                let id = path_id(route, "workflow")?;
                let status = query_value(&req.query(), "status")?;
                ok(&self.engine.list_activities(id, status).await?)
            }
            E::CreateActivity => {
                let workflow_id = path_id(route, "workflow")?;
                let input: CreateActivityBody = body(req)?;
                if let Some(assignee) = input.assignee_id {
                    self.known_principal(assignee)?;
                }
                let activity = self
                    .engine
                    .create_activity(NewActivity {
                        workflow_id,
                        parent_id: input.parent_id,
                        name: input.name,
                        description: input.description,
                        activity_type: input.activity_type,
                        sequence: input.sequence,
                        priority: input.priority,
                        assignee_id: input.assignee_id,
                        planned_start: input.planned_start,
                        planned_end: input.planned_end,
                        creator_id: caller(&ctx)?,
                    })
                    .await?;
                ok(&activity)
            }

            E::GetActivity => ok(&self.engine.activity(path_id(route, "activity")?).await?),
            E::ActivityAction(op) => {
                let id = path_id(route, "activity")?;
                let activity = match op {
                    ActivityOp::Start => self.engine.start_activity(id).await?,
                    ActivityOp::Complete => self.engine.complete_activity(id).await?,
                    ActivityOp::Block => self.engine.block_activity(id).await?,
                    ActivityOp::Unblock => self.engine.unblock_activity(id).await?,
                    ActivityOp::Skip => self.engine.skip_activity(id).await?,
                };
                ok(&activity)
            }
            E::SetProgress => {
                let id = path_id(route, "activity")?;
                let input: ProgressBody = body(req)?;
                ok(&self.engine.update_progress(id, input.progress).await?)
            }
            E::Assign => {
                let id = path_id(route, "activity")?;
                let input: AssignBody = body(req)?;
                if let Some(assignee) = input.assignee_id {
                    self.known_principal(assignee)?;
                }
                ok(&self.engine.assign(id, input.assignee_id).await?)
            }
            E::Readiness => {
                let readiness = self.engine.can_start(path_id(route, "activity")?).await?;
                ok(&json!({ "ready": readiness.is_satisfied(), "unmet": readiness.unmet }))
            }
            E::ListDependencies => {
                ok(&self.engine.dependencies_of(path_id(route, "activity")?).await?)
            }
            E::AddDependency => {
                let id = path_id(route, "activity")?;
                let input: DependencyBody = body(req)?;
                let dependency = self
                    .engine
                    .add_dependency(id, input.depends_on_id, input.dependency_type)
                    .await?;
                ok(&dependency)
            }
            E::RemoveDependency => {
                let id: DependencyId = path_id(route, "dependency")?;
                ok(&self.engine.remove_dependency(id).await?)
            }

            E::ListReviews => ok(&self.reviews.list(path_id(route, "activity")?).await?),
            E::OpenReview => {
                let activity_id = path_id(route, "activity")?;
                let input: OpenReviewBody = body(req)?;
                let review = self
                    .reviews
                    .open(NewReview {
                        activity_id,
                        review_type: input.review_type,
                        reviewer_id: input.reviewer_id,
                        comments: input.comments,
                        creator_id: caller(&ctx)?,
                    })
                    .await?;
                ok(&review)
            }
            E::GetReview => {
                let id: ReviewId = path_id(route, "review")?;
                ok(&self.reviews.review(id).await?)
            }
            E::SubmitReview => {
                let id = path_id(route, "review")?;
                let input: SubmitBody = body(req)?;
                ok(&self.reviews.submit(id, input.comments, input.score).await?)
            }
            E::DecideReview(verdict) => {
                let id = path_id(route, "review")?;
                let reviewer = caller(&ctx)?;
                let review = match verdict {
                    Verdict::Approve => self.reviews.approve(id, reviewer).await?,
                    Verdict::Reject => self.reviews.reject(id, reviewer).await?,
                    Verdict::Revision => self.reviews.request_revision(id, reviewer).await?,
                };
                ok(&review)
            }
        }
    }

    fn known_principal(&self, id: PrincipalId) -> KernelResult<()> {
        self.directory
            .get(id)
            .map(|_| ())
            .ok_or_else(|| KernelError::Validation(format!("unknown principal {id}")))
    }

    async fn login(&self, req: &InboundRequest, ctx: &RequestContext) -> KernelResult<ApiReply> {
        let input: LoginBody = body(req)?;
        let Some(principal) = self.directory.authenticate(&input.username, &input.password) else {
            debug!(username = %input.username, "login refused");
            return Err(KernelError::InvalidCredentials);
        };
        let pair = self
            .tokens
            .mint_pair_with_origin(principal.id, &principal.name, &principal.role, &origin(ctx))
            .await?;
        ok(&LoginReply {
            pair: &pair,
            user: Some(&principal),
        })
    }

    async fn refresh(&self, req: &InboundRequest, ctx: &RequestContext) -> KernelResult<ApiReply> {
        let input: RefreshBody = body(req)?;
        let pair = self
            .tokens
            .refresh_with_origin(&input.refresh_token, &*self.directory, &origin(ctx))
            .await
            .map_err(|err| {
                if err.kind().http_status() == 500 {
                    KernelError::from(err)
                } else {
                    debug!(error = %err, "refresh refused");
                    KernelError::InvalidRefreshToken
                }
            })?;
        ok(&LoginReply {
            pair: &pair,
            user: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdp_types::Classification;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn paging_falls_back_to_defaults() {
        assert_eq!(page_of(&query(&[])), PageRequest::new(1, 20));
        assert_eq!(page_of(&query(&[("page", "0"), ("page_size", "500")])), PageRequest::new(1, 20));
        assert_eq!(page_of(&query(&[("page", "x"), ("page_size", "50")])), PageRequest::new(1, 50));
        assert_eq!(page_of(&query(&[("page", "3"), ("page_size", "100")])), PageRequest::new(3, 100));
    }

    #[test]
    fn end_date_covers_the_whole_day() {
        let start = date_bound("2025-03-01", false).unwrap();
        let end = date_bound("2025-03-01", true).unwrap();
        assert_eq!(start.to_rfc3339(), "2025-03-01T00:00:00+00:00");
        assert!(end > start + chrono::Duration::hours(23));
        assert!(date_bound("03/01/2025", false).is_err());
        assert!(date_bound("2025-03-01T12:00:00Z", true).is_ok());
    }

    #[test]
    fn audit_filter_reads_both_principal_keys() {
        let who = PrincipalId::new();
        let raw = who.to_string();
        let filter = audit_filter(&query(&[
            ("user_id", raw.as_str()),
            ("classification", "confidential"),
            ("action", ""),
        ]))
        .unwrap();
        assert_eq!(filter.principal_id, Some(who));
        assert_eq!(filter.classification, Some(Classification::Confidential));
        assert_eq!(filter.action, None);

        let err = audit_filter(&query(&[("classification", "top-secret")])).unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
    }
}
