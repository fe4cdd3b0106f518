//! Kernel error and its envelope mapping
//!
//! Handlers return [`KernelError`]; [`KernelError::reply`] is the single place
//! a core failure becomes a status and a business code:
//! - dependency cycle is 400/4002, other validation 400/4000
//! - login and refresh failures are 401/4013 and 401/4014
//! - duplicates are 409/4091, every other conflict 409/4090
//! - internal failures are logged and answered with a generic 500/5000

use serde_json::json;
use tracing::error;

use rdp_access::{
    codes, denial_reply, token_reply, AccessError, ApiReply, AuditStoreError, SessionError,
    TokenError,
};
use rdp_types::ErrorKind;
use rdp_workflow::WorkflowError;

use crate::config::ConfigError;
use crate::directory::DirectoryError;

const INTERNAL_MESSAGE: &str = "internal server error";

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request could not be interpreted
    #[error("{0}")]
    Validation(String),

    /// Lookup by id missed
    #[error("{0} not found")]
    NotFound(String),

    /// JSON body did not decode
    #[error("{0}")]
    InvalidBody(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid refresh token")]
    InvalidRefreshToken,

    #[error("{0}")]
    Unexpected(String),
}

impl From<TokenError> for KernelError {
    fn from(value: TokenError) -> Self {
        Self::Access(value.into())
    }
}

impl From<SessionError> for KernelError {
    fn from(value: SessionError) -> Self {
        Self::Access(value.into())
    }
}

impl From<AuditStoreError> for KernelError {
    fn from(value: AuditStoreError) -> Self {
        Self::Access(value.into())
    }
}

impl KernelError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Workflow(err) => err.kind(),
            Self::Access(err) => err.kind(),
            Self::Directory(err) => err.kind(),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::InvalidBody(_) => ErrorKind::Validation,
            Self::InvalidCredentials | Self::InvalidRefreshToken => ErrorKind::Unauthenticated,
            Self::Config(_) | Self::Unexpected(_) => ErrorKind::Internal,
        }
    }

    /// Envelope for this failure
    #[must_use]
    pub fn reply(&self) -> ApiReply {
        if self.kind() == ErrorKind::Internal {
            error!(error = %self, "request failed");
            return match self {
                Self::Access(AccessError::Token(err)) => token_reply(err),
                _ => ApiReply::internal(INTERNAL_MESSAGE),
            };
        }
        match self {
            Self::Workflow(err) => workflow_reply(err),
            Self::Access(AccessError::Token(err)) => token_reply(err),
            Self::Access(AccessError::Denied(denial)) => denial_reply(denial),
            Self::InvalidBody(message) => ApiReply::error(400, codes::INVALID_BODY, message.clone()),
            Self::InvalidCredentials => {
                ApiReply::error(401, codes::INVALID_CREDENTIALS, self.to_string())
            }
            Self::InvalidRefreshToken => {
                ApiReply::error(401, codes::INVALID_REFRESH_TOKEN, self.to_string())
            }
            Self::Directory(DirectoryError::Duplicate(_)) => {
                ApiReply::error(409, codes::DUPLICATE, self.to_string())
            }
            other => ApiReply::from_kind(other.kind(), other.to_string()),
        }
    }
}

fn workflow_reply(err: &WorkflowError) -> ApiReply {
    match err {
        WorkflowError::DependencyCycle { .. } => {
            ApiReply::error(400, codes::DEPENDENCY_CYCLE, err.to_string())
        }
        WorkflowError::DuplicateDependency { .. } => {
            ApiReply::error(409, codes::DUPLICATE, err.to_string())
        }
        WorkflowError::DependenciesUnmet { unmet, .. } => {
            ApiReply::from_kind(err.kind(), err.to_string()).with_data(json!({ "unmet": unmet }))
        }
        _ => ApiReply::from_kind(err.kind(), err.to_string()),
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rdp_types::ActivityId;
    use rdp_workflow::{StoreError, TransitionError};

    #[test]
    fn workflow_errors_map_to_codes() {
        let a = ActivityId::new();
        let b = ActivityId::new();
        let cases = [
            (
                KernelError::from(WorkflowError::DependencyCycle {
                    activity: a,
                    depends_on: b,
                }),
                400,
                4002,
            ),
            (KernelError::from(WorkflowError::SelfDependency(a)), 400, 4000),
            (
                KernelError::from(WorkflowError::DuplicateDependency {
                    activity: a,
                    depends_on: b,
                }),
                409,
                4091,
            ),
            (
                KernelError::from(WorkflowError::from(TransitionError::TerminalState {
                    state: "completed",
                })),
                409,
                4090,
            ),
            (
                KernelError::from(WorkflowError::NotFound {
                    entity: "workflow",
                    id: "x".into(),
                }),
                404,
                4040,
            ),
        ];
        for (err, status, code) in cases {
            let reply = err.reply();
            assert_eq!((reply.status, reply.envelope.code), (status, code), "{err}");
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = KernelError::from(WorkflowError::Store(StoreError::Unavailable(
            "connection refused on 10.0.0.7".into(),
        )));
        let reply = err.reply();
        assert_eq!((reply.status, reply.envelope.code), (500, 5000));
        assert_eq!(reply.envelope.message, "internal server error");
    }

    #[test]
    fn unmet_dependencies_are_listed() {
        let a = ActivityId::new();
        let pred = ActivityId::new();
        let reply = KernelError::from(WorkflowError::DependenciesUnmet {
            activity: a,
            unmet: vec![pred],
        })
        .reply();
        assert_eq!(reply.status, 409);
        assert!(reply.envelope.message.contains("dependencies unmet"));
        assert_eq!(reply.envelope.data["unmet"][0], pred.to_string());
    }

    #[test]
    fn duplicate_principal_is_a_duplicate() {
        let reply = KernelError::from(DirectoryError::Duplicate("ada".into())).reply();
        assert_eq!((reply.status, reply.envelope.code), (409, 4091));
    }
}
