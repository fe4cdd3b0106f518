//! Error types for the workflow engine
//!
//! Keeps every failure distinct for assertions:
//! - state machine refusals (already in state, illegal, terminal)
//! - dependency problems (self loop, cycle, duplicate, unmet)
//! - lookups that missed
//! - storage failures
//!
//! [`WorkflowError::kind`] collapses them into an [`ErrorKind`] at the boundary.

use rdp_types::{ActivityId, ErrorKind};

/// Refusal from one of the transition tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Target equals the current state
    #[error("already in state {state}")]
    AlreadyInState { state: &'static str },

    /// Source state has no outbound transitions
    #[error("terminal state {state}")]
    TerminalState { state: &'static str },

    /// Pair does not appear in the table
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Storage failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Row changed between read and write
    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: String },

    /// Row does not exist
    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: String },

    /// Backend unreachable or failed
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Main workflow engine error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// State machine refused the change
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Entity lookup missed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Malformed input or value out of range
    #[error("validation failed: {0}")]
    Validation(String),

    /// Adding the edge would close a cycle
    #[error("dependency cycle: {activity} already reaches {depends_on}")]
    DependencyCycle {
        activity: ActivityId,
        depends_on: ActivityId,
    },

    /// An activity cannot depend on itself
    #[error("activity {0} cannot depend on itself")]
    SelfDependency(ActivityId),

    /// Edge already present
    #[error("dependency {activity} -> {depends_on} already exists")]
    DuplicateDependency {
        activity: ActivityId,
        depends_on: ActivityId,
    },

    /// Precedence gates not satisfied
    #[error("dependencies unmet for {activity}: {} predecessor(s) pending", .unmet.len())]
    DependenciesUnmet {
        activity: ActivityId,
        unmet: Vec<ActivityId>,
    },

    /// Enclosing workflow is not executing
    #[error("workflow is {state}, activities can only start while executing")]
    WorkflowNotExecuting { state: &'static str },

    /// Review or approval activity lacks an approved review
    #[error("activity {0} requires an approved review before completion")]
    ReviewRequired(ActivityId),

    /// Optimistic retries exhausted
    #[error("too much contention on {entity} {id}")]
    Contention { entity: &'static str, id: String },

    /// Storage failure
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for WorkflowError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Missing { entity, id } => Self::NotFound { entity, id },
            other => Self::Store(other),
        }
    }
}

impl WorkflowError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Boundary classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transition(_)
            | Self::DuplicateDependency { .. }
            | Self::DependenciesUnmet { .. }
            | Self::WorkflowNotExecuting { .. }
            | Self::ReviewRequired(_)
            | Self::Contention { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) | Self::DependencyCycle { .. } | Self::SelfDependency(_) => {
                ErrorKind::Validation
            }
            Self::Store(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is one of the three state machine refusals
    #[inline]
    #[must_use]
    pub fn is_transition(&self) -> bool {
        matches!(self, Self::Transition(_))
    }
}

/// Result alias for engine operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_collapse_state_errors_to_conflict() {
        let errors = [
            WorkflowError::from(TransitionError::AlreadyInState { state: "draft" }),
            WorkflowError::from(TransitionError::TerminalState { state: "completed" }),
            WorkflowError::from(TransitionError::IllegalTransition {
                from: "draft",
                to: "completed",
            }),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Conflict);
            assert!(err.is_transition());
        }
    }

    #[test]
    fn cycle_is_validation() {
        let err = WorkflowError::DependencyCycle {
            activity: ActivityId::new(),
            depends_on: ActivityId::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().starts_with("dependency cycle"));
    }

    #[test]
    fn missing_rows_become_not_found() {
        let err: WorkflowError = StoreError::Missing {
            entity: "workflow",
            id: "x".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
