//! Route table
//!
//! Maps `(method, path)` to a route template, the access it demands and the
//! endpoint that serves it. Path parameters are captured as raw strings;
//! handlers parse them after the access check.

use std::str::FromStr;

use rdp_access::{audit::API_PREFIX, Access, RouteMatch};
use rdp_types::{roles, PrincipalId};

const ADMIN: &[&str] = &[roles::ADMIN];
const ADMIN_OR_MANAGER: &[&str] = &[roles::ADMIN, roles::MANAGER];

const fn perm(resource: &'static str, action: &'static str) -> Access {
    Access::Permission { resource, action }
}

/// Activity state changes reachable over the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivityOp {
    Start,
    Complete,
    Block,
    Unblock,
    Skip,
}

/// Review decisions reachable over the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Approve,
    Reject,
    Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Health,

    Login,
    Refresh,
    Logout,
    Me,
    MySessions,

    AuditQuery,
    AuditGet,

    CreateUser,
    GetUser,
    SetRole,
    DeactivateUser,
    DeleteUser,
    AdminStats,

    ListWorkflows,
    CreateWorkflow,
    GetWorkflow,
    DeleteWorkflow,
    TransitionWorkflow,
    WorkflowTransitions,
    WorkflowProgress,
    WorkflowGraph,
    ListActivities,
    CreateActivity,

    GetActivity,
    ActivityAction(ActivityOp),
    SetProgress,
    Assign,
    Readiness,
    ListDependencies,
    AddDependency,
    RemoveDependency,

    ListReviews,
    OpenReview,
    GetReview,
    SubmitReview,
    DecideReview(Verdict),
}

fn route(pattern: &'static str, access: Access, endpoint: Endpoint) -> (RouteMatch, Endpoint) {
    (RouteMatch::new(pattern, access), endpoint)
}

fn with_id((route, endpoint): (RouteMatch, Endpoint), id: &str) -> (RouteMatch, Endpoint) {
    (route.with_param("id", id), endpoint)
}

/// Resolve a request line; `None` when nothing matches
pub(crate) fn resolve(method: &str, path: &str) -> Option<(RouteMatch, Endpoint)> {
    use Endpoint as E;

    if path == "/health" || path == "/health/" {
        return (method == "GET").then(|| route("/health", Access::Public, E::Health));
    }
    let rest = path.strip_prefix(API_PREFIX)?.trim_end_matches('/');
    let segments: Vec<&str> = rest.split('/').collect();

    let matched = match (method, segments.as_slice()) {
        ("POST", ["auth", "login"]) => route("/api/v1/auth/login", Access::Public, E::Login),
        ("POST", ["auth", "refresh"]) => route("/api/v1/auth/refresh", Access::Public, E::Refresh),
        ("POST", ["auth", "logout"]) => {
            route("/api/v1/auth/logout", Access::Authenticated, E::Logout)
        }
        ("GET", ["auth", "me"]) => route("/api/v1/auth/me", Access::Authenticated, E::Me),
        ("GET", ["auth", "sessions"]) => {
            route("/api/v1/auth/sessions", Access::Authenticated, E::MySessions)
        }

        ("GET", ["audit-logs"]) => {
            route("/api/v1/audit-logs", perm("audit-logs", "read"), E::AuditQuery)
        }
        ("GET", ["audit-logs", id]) => with_id(
            route("/api/v1/audit-logs/:id", perm("audit-logs", "read"), E::AuditGet),
            id,
        ),

        ("POST", ["users"]) => route("/api/v1/users", Access::Roles(ADMIN), E::CreateUser),
        ("GET", ["users", id]) => {
            // a malformed id can never name the caller, so only the roles apply
            let access = PrincipalId::from_str(id).map_or(Access::Roles(ADMIN_OR_MANAGER), |target| {
                Access::RoleOrSelf {
                    roles: ADMIN_OR_MANAGER,
                    target,
                }
            });
            with_id(route("/api/v1/users/:id", access, E::GetUser), id)
        }
        ("PUT", ["users", id, "role"]) => with_id(
            route("/api/v1/users/:id/role", Access::Roles(ADMIN), E::SetRole),
            id,
        ),
        ("POST", ["users", id, "deactivate"]) => with_id(
            route("/api/v1/users/:id/deactivate", Access::Roles(ADMIN), E::DeactivateUser),
            id,
        ),
        ("DELETE", ["users", id]) => with_id(
            route("/api/v1/users/:id", Access::Roles(ADMIN), E::DeleteUser),
            id,
        ),
        ("GET", ["admin", "stats"]) => {
            route("/api/v1/admin/stats", Access::Roles(ADMIN), E::AdminStats)
        }

        ("GET", ["workflows"]) => {
            route("/api/v1/workflows", perm("workflow", "read"), E::ListWorkflows)
        }
        ("POST", ["workflows"]) => {
            route("/api/v1/workflows", perm("workflow", "create"), E::CreateWorkflow)
        }
        ("GET", ["workflows", id]) => with_id(
            route("/api/v1/workflows/:id", perm("workflow", "read"), E::GetWorkflow),
            id,
        ),
        ("DELETE", ["workflows", id]) => with_id(
            route("/api/v1/workflows/:id", perm("workflow", "delete"), E::DeleteWorkflow),
            id,
        ),
        ("POST", ["workflows", id, "transition"]) => with_id(
            route(
                "/api/v1/workflows/:id/transition",
                perm("workflow", "update"),
                E::TransitionWorkflow,
            ),
            id,
        ),
        ("GET", ["workflows", id, "transitions"]) => with_id(
            route(
                "/api/v1/workflows/:id/transitions",
                perm("workflow", "read"),
                E::WorkflowTransitions,
            ),
            id,
        ),
        ("GET", ["workflows", id, "progress"]) => with_id(
            route(
                "/api/v1/workflows/:id/progress",
                perm("workflow", "read"),
                E::WorkflowProgress,
            ),
            id,
        ),
        ("GET", ["workflows", id, "graph"]) => with_id(
            route(
                "/api/v1/workflows/:id/graph",
                perm("dependency", "read"),
                E::WorkflowGraph,
            ),
            id,
        ),
        ("GET", ["workflows", id, "activities"]) => with_id(
            route(
                "/api/v1/workflows/:id/activities",
                perm("activity", "read"),
                E::ListActivities,
            ),
            id,
        ),
        ("POST", ["workflows", id, "activities"]) => with_id(
            route(
                "/api/v1/workflows/:id/activities",
                perm("activity", "create"),
                E::CreateActivity,
            ),
            id,
        ),

        ("GET", ["activities", id]) => with_id(
            route("/api/v1/activities/:id", perm("activity", "read"), E::GetActivity),
            id,
        ),
        ("POST", ["activities", id, op]) => {
            let (pattern, op) = match *op {
                "start" => ("/api/v1/activities/:id/start", ActivityOp::Start),
                "complete" => ("/api/v1/activities/:id/complete", ActivityOp::Complete),
                "block" => ("/api/v1/activities/:id/block", ActivityOp::Block),
                "unblock" => ("/api/v1/activities/:id/unblock", ActivityOp::Unblock),
                "skip" => ("/api/v1/activities/:id/skip", ActivityOp::Skip),
                "dependencies" => {
                    return Some(with_id(
                        route(
                            "/api/v1/activities/:id/dependencies",
                            perm("dependency", "create"),
                            E::AddDependency,
                        ),
                        id,
                    ))
                }
                "reviews" => {
                    return Some(with_id(
                        route(
                            "/api/v1/activities/:id/reviews",
                            perm("review", "create"),
                            E::OpenReview,
                        ),
                        id,
                    ))
                }
                _ => return None,
            };
            with_id(
                route(pattern, perm("activity", "update"), E::ActivityAction(op)),
                id,
            )
        }
        ("PUT", ["activities", id, "progress"]) => with_id(
            route(
                "/api/v1/activities/:id/progress",
                perm("activity", "update"),
                E::SetProgress,
            ),
            id,
        ),
        ("PUT", ["activities", id, "assignee"]) => with_id(
            route(
                "/api/v1/activities/:id/assignee",
                perm("activity", "update"),
                E::Assign,
            ),
            id,
        ),
        ("GET", ["activities", id, "readiness"]) => with_id(
            route(
                "/api/v1/activities/:id/readiness",
                perm("activity", "read"),
                E::Readiness,
            ),
            id,
        ),
        ("GET", ["activities", id, "dependencies"]) => with_id(
            route(
                "/api/v1/activities/:id/dependencies",
                perm("dependency", "read"),
                E::ListDependencies,
            ),
            id,
        ),
        ("GET", ["activities", id, "reviews"]) => with_id(
            route(
                "/api/v1/activities/:id/reviews",
                perm("review", "read"),
                E::ListReviews,
            ),
            id,
        ),
        ("DELETE", ["dependencies", id]) => with_id(
            route(
                "/api/v1/dependencies/:id",
                perm("dependency", "delete"),
                E::RemoveDependency,
            ),
            id,
        ),

        ("GET", ["reviews", id]) => with_id(
            route("/api/v1/reviews/:id", perm("review", "read"), E::GetReview),
            id,
        ),
        ("POST", ["reviews", id, "submit"]) => with_id(
            route(
                "/api/v1/reviews/:id/submit",
                perm("review", "update"),
                E::SubmitReview,
            ),
            id,
        ),
        ("POST", ["reviews", id, verdict]) => {
            let (pattern, verdict) = match *verdict {
                "approve" => ("/api/v1/reviews/:id/approve", Verdict::Approve),
                "reject" => ("/api/v1/reviews/:id/reject", Verdict::Reject),
                "revision" => ("/api/v1/reviews/:id/revision", Verdict::Revision),
                _ => return None,
            };
            with_id(
                route(pattern, perm("review", "approve"), E::DecideReview(verdict)),
                id,
            )
        }

        _ => return None,
    };
    Some(matched)
}
