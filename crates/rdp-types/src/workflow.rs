//! Workflow, activity, dependency and review records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{
    ActivityId, DependencyId, PrincipalId, ProjectId, ReviewId, TemplateId, WorkflowId,
};
use crate::label::labelled_enum;

labelled_enum! {
    /// Lifecycle state of a workflow
    WorkflowState ("workflow state") {
        Draft => "draft",
        Planning => "planning",
        Executing => "executing",
        Reviewing => "reviewing",
        Paused => "paused",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

impl WorkflowState {
    /// No outbound transitions exist from this state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

labelled_enum! {
    /// What kind of work an activity represents
    ActivityType ("activity type") {
        Task => "task",
        Milestone => "milestone",
        /// Design checkpoint
        Dcp => "dcp",
        Review => "review",
        Approval => "approval",
    }
}

impl ActivityType {
    /// Completion requires at least one approved review
    #[must_use]
    pub const fn needs_approved_review(self) -> bool {
        matches!(self, Self::Review | Self::Approval)
    }
}

labelled_enum! {
    /// Lifecycle state of an activity
    ActivityStatus ("activity status") {
        Pending => "pending",
        Ready => "ready",
        Running => "running",
        Reviewing => "reviewing",
        Completed => "completed",
        Approved => "approved",
        Rejected => "rejected",
        Skipped => "skipped",
        Blocked => "blocked",
    }
}

impl ActivityStatus {
    /// No outbound transitions exist from this state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Approved | Self::Skipped)
    }

    /// Work on the activity has begun
    #[must_use]
    pub const fn has_started(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Reviewing | Self::Completed | Self::Approved
        )
    }

    /// Work on the activity has finished successfully
    #[must_use]
    pub const fn has_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }
}

labelled_enum! {
    /// Precedence relation between two activities
    DependencyType ("dependency type") {
        /// Dependent may start only after the predecessor completes
        FinishToStart => "finish_to_start",
        /// Dependent may start only after the predecessor starts
        StartToStart => "start_to_start",
        /// Dependent may complete only after the predecessor completes
        FinishToFinish => "finish_to_finish",
        /// Dependent may complete only after the predecessor starts
        StartToFinish => "start_to_finish",
    }
}

impl DependencyType {
    /// The relation constrains when the dependent may start
    #[must_use]
    pub const fn gates_start(self) -> bool {
        matches!(self, Self::FinishToStart | Self::StartToStart)
    }

    /// Whether a predecessor in `status` satisfies this relation
    #[must_use]
    pub const fn satisfied_by(self, status: ActivityStatus) -> bool {
        match self {
            Self::FinishToStart | Self::FinishToFinish => status.has_finished(),
            Self::StartToStart | Self::StartToFinish => status.has_started(),
        }
    }
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::FinishToStart
    }
}

labelled_enum! {
    /// Kind of review requested
    ReviewType ("review type") {
        /// Design checkpoint review
        Dcp => "dcp",
        Code => "code",
        Doc => "doc",
        Final => "final",
    }
}

labelled_enum! {
    /// Lifecycle state of a review
    ReviewStatus ("review status") {
        Pending => "pending",
        Submitted => "submitted",
        Approved => "approved",
        Rejected => "rejected",
        Revision => "revision",
    }
}

impl ReviewStatus {
    /// A reviewer has recorded a decision
    #[must_use]
    pub const fn is_decided(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Revision)
    }
}

/// A workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub template_id: Option<TemplateId>,
    pub name: String,
    pub description: String,
    pub state: WorkflowState,
    /// Aggregated progress of the top-level activities (0..=100)
    pub progress: u8,
    /// Set on first entry into `executing`, never changed afterwards
    pub started_at: Option<DateTime<Utc>>,
    /// Set on entry into `completed` or `cancelled`
    pub completed_at: Option<DateTime<Utc>>,
    pub creator_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every update
    #[serde(default)]
    pub version: u64,
}

/// Input for creating a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub project_id: ProjectId,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub creator_id: PrincipalId,
}

impl NewWorkflow {
    /// Create new workflow input
    #[must_use]
    pub fn new(project_id: ProjectId, name: impl Into<String>, creator_id: PrincipalId) -> Self {
        Self {
            project_id,
            template_id: None,
            name: name.into(),
            description: String::new(),
            creator_id,
        }
    }

    /// Attach a description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Record the template this workflow was built from
    #[must_use]
    pub fn with_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }
}

/// A unit of work inside a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    /// Parent activity for nested work; `None` for top-level activities
    pub parent_id: Option<ActivityId>,
    pub name: String,
    pub description: String,
    pub activity_type: ActivityType,
    pub status: ActivityStatus,
    /// Ordering hint inside the workflow
    pub sequence: i32,
    pub priority: i32,
    /// Completion percentage (0..=100)
    pub progress: u8,
    pub assignee_id: Option<PrincipalId>,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    /// Set on first entry into `running`
    pub actual_start: Option<DateTime<Utc>>,
    /// Set on entry into `completed` or `approved`
    pub actual_end: Option<DateTime<Utc>>,
    pub creator_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

/// Input for creating an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActivity {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub parent_id: Option<ActivityId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub assignee_id: Option<PrincipalId>,
    #[serde(default)]
    pub planned_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub planned_end: Option<DateTime<Utc>>,
    pub creator_id: PrincipalId,
}

impl NewActivity {
    /// Create new activity input
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        name: impl Into<String>,
        activity_type: ActivityType,
        creator_id: PrincipalId,
    ) -> Self {
        Self {
            workflow_id,
            parent_id: None,
            name: name.into(),
            description: String::new(),
            activity_type,
            sequence: 0,
            priority: 0,
            assignee_id: None,
            planned_start: None,
            planned_end: None,
            creator_id,
        }
    }

    /// Nest under another activity
    #[must_use]
    pub fn with_parent(mut self, parent_id: ActivityId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set ordering hint
    #[must_use]
    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Assign up front
    #[must_use]
    pub fn with_assignee(mut self, assignee_id: PrincipalId) -> Self {
        self.assignee_id = Some(assignee_id);
        self
    }

    /// Planned window
    #[must_use]
    pub fn with_plan(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.planned_start = Some(start);
        self.planned_end = Some(end);
        self
    }
}

/// Directed precedence edge: `activity_id` depends on `depends_on_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: DependencyId,
    pub activity_id: ActivityId,
    pub depends_on_id: ActivityId,
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

/// A review attached to an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub activity_id: ActivityId,
    pub project_id: ProjectId,
    pub review_type: ReviewType,
    pub status: ReviewStatus,
    pub reviewer_id: Option<PrincipalId>,
    pub comments: String,
    /// Reviewer score (0..=100), present once decided
    pub score: Option<u8>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Present iff the status is a decision
    pub reviewed_at: Option<DateTime<Utc>>,
    pub creator_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

/// Input for opening a review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReview {
    pub activity_id: ActivityId,
    pub review_type: ReviewType,
    #[serde(default)]
    pub reviewer_id: Option<PrincipalId>,
    #[serde(default)]
    pub comments: String,
    pub creator_id: PrincipalId,
}

impl NewReview {
    /// Create new review input
    #[must_use]
    pub fn new(activity_id: ActivityId, review_type: ReviewType, creator_id: PrincipalId) -> Self {
        Self {
            activity_id,
            review_type,
            reviewer_id: None,
            comments: String::new(),
            creator_id,
        }
    }

    /// Nominate a reviewer
    #[must_use]
    pub fn with_reviewer(mut self, reviewer_id: PrincipalId) -> Self {
        self.reviewer_id = Some(reviewer_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn labels_round_trip() {
        for state in WorkflowState::ALL {
            assert_eq!(WorkflowState::from_str(state.as_str()).unwrap(), *state);
        }
        for status in ActivityStatus::ALL {
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!(DependencyType::from_str("finish-to-start").is_err());
    }

    #[test]
    fn dependency_satisfaction() {
        use ActivityStatus::*;
        assert!(DependencyType::FinishToStart.satisfied_by(Completed));
        assert!(DependencyType::FinishToStart.satisfied_by(Approved));
        assert!(!DependencyType::FinishToStart.satisfied_by(Running));
        assert!(DependencyType::StartToStart.satisfied_by(Running));
        assert!(DependencyType::StartToStart.satisfied_by(Reviewing));
        assert!(!DependencyType::StartToStart.satisfied_by(Ready));
        assert!(!DependencyType::StartToFinish.satisfied_by(Blocked));
    }

    #[test]
    fn terminal_sets() {
        let terminal: Vec<_> = ActivityStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 3);
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
    }
}
