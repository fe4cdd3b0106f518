//! RDP Types - shared vocabulary of the portal core
//!
//! Provides:
//! - Time-ordered ULID identifiers, one newtype per entity
//! - An injectable, monotonic clock
//! - Workflow, activity, dependency and review records
//! - Principal, session, audit and API metric records
//! - Offset pagination
//! - The error classes shared by every boundary

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod label;

pub mod access;
pub mod clock;
pub mod error;
pub mod id;
pub mod page;
pub mod workflow;

pub use access::{roles, ApiMetric, AuditRecord, Classification, Principal, Session};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::ErrorKind;
pub use id::{
    id_time, looks_like_id, new_id, parse_id, ActivityId, AuditId, DependencyId, IdError,
    PrincipalId, ProjectId, ReviewId, SessionId, TemplateId, WorkflowId,
};
pub use label::LabelError;
pub use page::{Page, PageRequest};
pub use workflow::{
    Activity, ActivityStatus, ActivityType, Dependency, DependencyType, NewActivity, NewReview,
    NewWorkflow, Review, ReviewStatus, ReviewType, Workflow, WorkflowState,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with RDP types
    pub use crate::{
        Activity, ActivityId, ActivityStatus, ActivityType, Clock, DependencyType, PrincipalId,
        SharedClock, Workflow, WorkflowId, WorkflowState,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
