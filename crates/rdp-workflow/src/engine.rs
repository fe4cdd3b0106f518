//! Workflow engine
//!
//! The single place workflow and activity state is mutated:
//! - workflow transitions with entry timestamps
//! - activity start/complete/block/unblock/skip gated by dependencies
//! - dependency insertion with cycle rejection
//! - progress aggregation after every activity change
//! - eager pending -> ready promotion when a predecessor finishes
//!
//! Every mutation is read, validate, write against the row version. A lost
//! race re-reads and re-validates, so the loser usually observes
//! `already in state` or `illegal transition`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use rdp_types::{
    Activity, ActivityId, ActivityStatus, Dependency, DependencyId, DependencyType, NewActivity,
    NewWorkflow, Page, PageRequest, PrincipalId, ProjectId, SharedClock, Workflow, WorkflowId,
    WorkflowState,
};

use crate::error::{StoreError, TransitionError, WorkflowError, WorkflowResult};
use crate::fsm::Lifecycle;
use crate::graph::{resolve, DependencyGraph, Gate, Readiness};
use crate::progress::{aggregate, ProgressReport};
use crate::store::{CascadeSummary, WorkflowStore};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Re-read/re-validate attempts after a version conflict
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_retries: 8 }
    }
}

/// Filter for workflow listings
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowFilter {
    pub project_id: Option<ProjectId>,
    pub state: Option<WorkflowState>,
}

/// State read alongside an activity before validating a change
#[derive(Debug)]
pub(crate) struct ActivityContext {
    pub(crate) now: DateTime<Utc>,
    pub(crate) workflow_state: WorkflowState,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) predecessors: HashMap<ActivityId, ActivityStatus>,
    pub(crate) approved_reviews: usize,
}

impl ActivityContext {
    pub(crate) fn readiness(&self, gate: Gate) -> Readiness {
        resolve(&self.dependencies, gate, |id| self.predecessors.get(&id).copied())
    }
}

/// Set entry timestamps and move a workflow into `to`
fn enter_workflow_state(workflow: &mut Workflow, to: WorkflowState, now: DateTime<Utc>) {
    if to == WorkflowState::Executing && workflow.started_at.is_none() {
        workflow.started_at = Some(now);
    }
    if to.is_terminal() && workflow.completed_at.is_none() {
        workflow.completed_at = Some(now);
    }
    workflow.state = to;
    workflow.updated_at = now;
}

/// Validate `activity -> to` against the table and the gates, then apply it
pub(crate) fn apply_activity_transition(
    activity: &mut Activity,
    to: ActivityStatus,
    ctx: &ActivityContext,
) -> WorkflowResult<()> {
    let from = activity.status;
    from.check_transition(to)?;

    if to == ActivityStatus::Running && matches!(from, ActivityStatus::Pending | ActivityStatus::Ready)
    {
        if ctx.workflow_state != WorkflowState::Executing {
            return Err(WorkflowError::WorkflowNotExecuting {
                state: ctx.workflow_state.as_str(),
            });
        }
        let readiness = ctx.readiness(Gate::Start);
        if !readiness.is_satisfied() {
            return Err(WorkflowError::DependenciesUnmet {
                activity: activity.id,
                unmet: readiness.unmet,
            });
        }
    }

    if to.has_finished() {
        let readiness = ctx.readiness(Gate::Finish);
        if !readiness.is_satisfied() {
            return Err(WorkflowError::DependenciesUnmet {
                activity: activity.id,
                unmet: readiness.unmet,
            });
        }
        if activity.activity_type.needs_approved_review() && ctx.approved_reviews == 0 {
            return Err(WorkflowError::ReviewRequired(activity.id));
        }
    }

    if to == ActivityStatus::Running && activity.actual_start.is_none() {
        activity.actual_start = Some(ctx.now);
    }
    if to.has_finished() {
        activity.progress = 100;
        if activity.actual_end.is_none() {
            activity.actual_end = Some(ctx.now);
        }
    }
    activity.status = to;
    Ok(())
}

fn is_version_conflict(err: &WorkflowError) -> bool {
    matches!(err, WorkflowError::Store(StoreError::VersionConflict { .. }))
}

/// Workflow engine service
#[derive(Debug)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    clock: SharedClock,
    config: EngineConfig,
    /// Serializes dependency graph edits so two inserts cannot close a cycle together
    graph_lock: tokio::sync::Mutex<()>,
    /// Per workflow: its own transitions and every activity mutation inside it
    lifecycle_locks: parking_lot::Mutex<HashMap<WorkflowId, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowEngine {
    /// Create new engine over a store
    #[must_use]
    pub fn new(store: Arc<dyn WorkflowStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            config: EngineConfig::default(),
            graph_lock: tokio::sync::Mutex::new(()),
            lifecycle_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Override tuning
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn lock_lifecycle(&self, workflow: WorkflowId) -> OwnedMutexGuard<()> {
        let lock = self.lifecycle_locks.lock().entry(workflow).or_default().clone();
        lock.lock_owned().await
    }

    /// Run `op` until it stops losing version races
    async fn with_retry<T, F, Fut>(
        &self,
        entity: &'static str,
        id: impl ToString,
        mut op: F,
    ) -> WorkflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if is_version_conflict(&err) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(WorkflowError::Contention {
                            entity,
                            id: id.to_string(),
                        });
                    }
                    debug!(entity, attempt, "version conflict, re-reading");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    // ----- workflows -----

    #[instrument(skip(self, input), fields(project = %input.project_id))]
    pub async fn create_workflow(&self, input: NewWorkflow) -> WorkflowResult<Workflow> {
        if input.name.trim().is_empty() {
            return Err(WorkflowError::Validation("workflow name is required".into()));
        }
        let now = self.clock.now();
        let workflow = Workflow {
            id: WorkflowId::new(),
            project_id: input.project_id,
            template_id: input.template_id,
            name: input.name,
            description: input.description,
            state: WorkflowState::Draft,
            progress: 0,
            started_at: None,
            completed_at: None,
            creator_id: input.creator_id,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store.insert_workflow(workflow.clone()).await?;
        info!(workflow = %workflow.id, "workflow created");
        Ok(workflow)
    }

    pub async fn workflow(&self, id: WorkflowId) -> WorkflowResult<Workflow> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("workflow", id))
    }

    /// Newest first, paginated
    pub async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        page: PageRequest,
    ) -> WorkflowResult<Page<Workflow>> {
        let rows: Vec<Workflow> = self
            .store
            .list_workflows(filter.project_id)
            .await?
            .into_iter()
            .filter(|w| filter.state.map_or(true, |s| w.state == s))
            .collect();
        Ok(Page::from_ordered(rows, page))
    }

    /// Legal targets from the workflow's current state
    pub async fn available_transitions(&self, id: WorkflowId) -> WorkflowResult<Vec<WorkflowState>> {
        Ok(self.workflow(id).await?.state.successors().to_vec())
    }

    #[instrument(skip(self))]
    pub async fn transition_workflow(
        &self,
        id: WorkflowId,
        to: WorkflowState,
    ) -> WorkflowResult<Workflow> {
        let _lifecycle = self.lock_lifecycle(id).await;
        let saved = self
            .with_retry("workflow", id, || async move {
                let mut workflow = self.workflow(id).await?;
                workflow.state.check_transition(to)?;
                let from = workflow.state;
                enter_workflow_state(&mut workflow, to, self.clock.now());
                let saved = self.store.update_workflow(workflow).await?;
                Ok::<_, WorkflowError>((from, saved))
            })
            .await;
        match saved {
            Ok((from, workflow)) => {
                info!(workflow = %id, from = %from, to = %to, "workflow transitioned");
                Ok(workflow)
            }
            Err(err) => {
                debug!(workflow = %id, to = %to, error = %err, "workflow transition refused");
                Err(err)
            }
        }
    }

    /// Delete a workflow with its activities, dependencies and reviews
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, id: WorkflowId) -> WorkflowResult<CascadeSummary> {
        let _graph = self.graph_lock.lock().await;
        let summary = self.store.delete_workflow(id).await?;
        self.lifecycle_locks.lock().remove(&id);
        info!(
            workflow = %id,
            activities = summary.activities,
            dependencies = summary.dependencies,
            reviews = summary.reviews,
            "workflow deleted"
        );
        Ok(summary)
    }

    /// Aggregate without writing
    pub async fn progress(&self, id: WorkflowId) -> WorkflowResult<ProgressReport> {
        self.workflow(id).await?;
        let activities = self.store.list_activities(id).await?;
        Ok(aggregate(&activities))
    }

    /// Recompute and persist workflow progress
    pub async fn refresh_progress(&self, id: WorkflowId) -> WorkflowResult<ProgressReport> {
        self.with_retry("workflow", id, || async move {
            // workflow first so a concurrent activity write forces a version conflict
            let mut workflow = self.workflow(id).await?;
            let activities = self.store.list_activities(id).await?;
            let report = aggregate(&activities);
            if workflow.progress != report.progress {
                workflow.progress = report.progress;
                workflow.updated_at = self.clock.now();
                self.store.update_workflow(workflow).await?;
            }
            if report.stalled {
                warn!(workflow = %id, blocked = report.blocked, "workflow stalled");
            }
            Ok::<_, WorkflowError>(report)
        })
        .await
    }

    // ----- activities -----

    #[instrument(skip(self, input), fields(workflow = %input.workflow_id))]
    pub async fn create_activity(&self, input: NewActivity) -> WorkflowResult<Activity> {
        if input.name.trim().is_empty() {
            return Err(WorkflowError::Validation("activity name is required".into()));
        }
        if let (Some(start), Some(end)) = (input.planned_start, input.planned_end) {
            if end < start {
                return Err(WorkflowError::Validation(
                    "planned end precedes planned start".into(),
                ));
            }
        }
        let workflow = self.workflow(input.workflow_id).await?;
        if workflow.state.is_terminal() {
            return Err(TransitionError::TerminalState {
                state: workflow.state.as_str(),
            }
            .into());
        }
        if let Some(parent_id) = input.parent_id {
            let parent = self.activity(parent_id).await?;
            if parent.workflow_id != workflow.id {
                return Err(WorkflowError::Validation(
                    "parent activity belongs to another workflow".into(),
                ));
            }
        }

        let now = self.clock.now();
        let activity = Activity {
            id: ActivityId::new(),
            workflow_id: workflow.id,
            project_id: workflow.project_id,
            parent_id: input.parent_id,
            name: input.name,
            description: input.description,
            activity_type: input.activity_type,
            status: ActivityStatus::Pending,
            sequence: input.sequence,
            priority: input.priority,
            progress: 0,
            assignee_id: input.assignee_id,
            planned_start: input.planned_start,
            planned_end: input.planned_end,
            actual_start: None,
            actual_end: None,
            creator_id: input.creator_id,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store.insert_activity(activity.clone()).await?;
        self.refresh_progress(workflow.id).await?;
        info!(activity = %activity.id, kind = %activity.activity_type, "activity created");
        Ok(activity)
    }

    pub async fn activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.store
            .get_activity(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("activity", id))
    }

    /// Ordered by sequence then id, optionally filtered by status
    pub async fn list_activities(
        &self,
        workflow: WorkflowId,
        status: Option<ActivityStatus>,
    ) -> WorkflowResult<Vec<Activity>> {
        self.workflow(workflow).await?;
        Ok(self
            .store
            .list_activities(workflow)
            .await?
            .into_iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect())
    }

    async fn context_for(&self, activity: &Activity) -> WorkflowResult<ActivityContext> {
        let workflow = self.workflow(activity.workflow_id).await?;
        let dependencies = self.store.dependencies_of(activity.id).await?;
        let mut predecessors = HashMap::with_capacity(dependencies.len());
        for dep in &dependencies {
            if let Some(pred) = self.store.get_activity(dep.depends_on_id).await? {
                predecessors.insert(pred.id, pred.status);
            }
        }
        let approved_reviews = self
            .store
            .list_reviews(activity.id)
            .await?
            .iter()
            .filter(|r| r.status == rdp_types::ReviewStatus::Approved)
            .count();
        Ok(ActivityContext {
            now: self.clock.now(),
            workflow_state: workflow.state,
            dependencies,
            predecessors,
            approved_reviews,
        })
    }

    /// Read, apply, write with retries; then propagate.
    ///
    /// Holds the workflow's lifecycle lock throughout, so the workflow state
    /// seen by `apply` cannot change before the write lands.
    async fn mutate_activity<F>(&self, id: ActivityId, mut apply: F) -> WorkflowResult<Activity>
    where
        F: FnMut(&mut Activity, &ActivityContext) -> WorkflowResult<()> + Send,
    {
        let workflow = self.activity(id).await?.workflow_id;
        let _lifecycle = self.lock_lifecycle(workflow).await;
        let mut attempt = 0;
        loop {
            let mut activity = self.activity(id).await?;
            let before = activity.status;
            let ctx = self.context_for(&activity).await?;
            apply(&mut activity, &ctx)?;
            activity.updated_at = ctx.now;
            match self.store.update_activity(activity).await {
                Ok(saved) => {
                    if saved.status != before {
                        debug!(activity = %id, from = %before, to = %saved.status, "activity moved");
                    }
                    self.after_activity_change(&saved, before).await?;
                    return Ok(saved);
                }
                Err(StoreError::VersionConflict { entity, id: row }) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(WorkflowError::Contention { entity, id: row });
                    }
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn after_activity_change(
        &self,
        activity: &Activity,
        before: ActivityStatus,
    ) -> WorkflowResult<()> {
        if activity.status != before && activity.status.has_finished() {
            self.promote_dependents(activity.id).await?;
        }
        self.refresh_progress(activity.workflow_id).await?;
        Ok(())
    }

    /// Move `pending` dependents whose start gates are now met to `ready`
    async fn promote_dependents(&self, predecessor: ActivityId) -> WorkflowResult<()> {
        for dep in self.store.dependents_of(predecessor).await? {
            self.settle_readiness(dep.activity_id).await?;
        }
        Ok(())
    }

    /// Re-derive pending/ready for one activity from its start gates
    async fn settle_readiness(&self, id: ActivityId) -> WorkflowResult<()> {
        self.with_retry("activity", id, || async move {
            let Some(mut activity) = self.store.get_activity(id).await? else {
                return Ok::<_, WorkflowError>(());
            };
            let ctx = self.context_for(&activity).await?;
            let satisfied = ctx.readiness(Gate::Start).is_satisfied();
            let target = match (activity.status, satisfied) {
                (ActivityStatus::Pending, true) => ActivityStatus::Ready,
                (ActivityStatus::Ready, false) => ActivityStatus::Pending,
                _ => return Ok(()),
            };
            activity.status = target;
            activity.updated_at = ctx.now;
            self.store.update_activity(activity).await?;
            debug!(activity = %id, to = %target, "readiness settled");
            Ok(())
        })
        .await
    }

    /// Start work: requires pending/ready, an executing workflow and met start gates
    #[instrument(skip(self))]
    pub async fn start_activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.mutate_activity(id, |activity, ctx| {
            if !matches!(activity.status, ActivityStatus::Pending | ActivityStatus::Ready) {
                activity.status.check_transition(ActivityStatus::Running)?;
                return Err(TransitionError::IllegalTransition {
                    from: activity.status.as_str(),
                    to: ActivityStatus::Running.as_str(),
                }
                .into());
            }
            apply_activity_transition(activity, ActivityStatus::Running, ctx)
        })
        .await
    }

    /// Finish work: requires running, met finish gates and, for review and
    /// approval activities, an approved review
    #[instrument(skip(self))]
    pub async fn complete_activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.mutate_activity(id, |activity, ctx| {
            apply_activity_transition(activity, ActivityStatus::Completed, ctx)
        })
        .await
    }

    /// Any table transition, with the same gates as start and complete
    #[instrument(skip(self))]
    pub async fn transition_activity(
        &self,
        id: ActivityId,
        to: ActivityStatus,
    ) -> WorkflowResult<Activity> {
        self.mutate_activity(id, |activity, ctx| apply_activity_transition(activity, to, ctx))
            .await
    }

    #[instrument(skip(self))]
    pub async fn block_activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.transition_activity(id, ActivityStatus::Blocked).await
    }

    /// Leave `blocked` for `ready` if start gates are met, else `pending`
    #[instrument(skip(self))]
    pub async fn unblock_activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.mutate_activity(id, |activity, ctx| {
            let to = if ctx.readiness(Gate::Start).is_satisfied() {
                ActivityStatus::Ready
            } else {
                ActivityStatus::Pending
            };
            if activity.status != ActivityStatus::Blocked {
                activity.status.check_transition(to)?;
                return Err(TransitionError::IllegalTransition {
                    from: activity.status.as_str(),
                    to: to.as_str(),
                }
                .into());
            }
            apply_activity_transition(activity, to, ctx)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn skip_activity(&self, id: ActivityId) -> WorkflowResult<Activity> {
        self.transition_activity(id, ActivityStatus::Skipped).await
    }

    /// Set progress in 0..=100. Reaching 100 does not complete the activity.
    #[instrument(skip(self))]
    pub async fn update_progress(&self, id: ActivityId, progress: u32) -> WorkflowResult<Activity> {
        let Ok(value) = u8::try_from(progress) else {
            return Err(WorkflowError::Validation(
                "progress must be between 0 and 100".into(),
            ));
        };
        if value > 100 {
            return Err(WorkflowError::Validation(
                "progress must be between 0 and 100".into(),
            ));
        }
        self.mutate_activity(id, |activity, _| {
            if activity.status.is_terminal() {
                return Err(TransitionError::TerminalState {
                    state: activity.status.as_str(),
                }
                .into());
            }
            activity.progress = value;
            Ok(())
        })
        .await
    }

    /// Set or clear the assignee; refused in terminal states
    #[instrument(skip(self))]
    pub async fn assign(
        &self,
        id: ActivityId,
        assignee: Option<PrincipalId>,
    ) -> WorkflowResult<Activity> {
        self.mutate_activity(id, |activity, _| {
            if activity.status.is_terminal() {
                return Err(TransitionError::TerminalState {
                    state: activity.status.as_str(),
                }
                .into());
            }
            activity.assignee_id = assignee;
            Ok(())
        })
        .await
    }

    /// Read-only start gate check
    pub async fn can_start(&self, id: ActivityId) -> WorkflowResult<Readiness> {
        let activity = self.activity(id).await?;
        Ok(self.context_for(&activity).await?.readiness(Gate::Start))
    }

    // ----- dependencies -----

    /// Record that `activity` depends on `depends_on`
    #[instrument(skip(self))]
    pub async fn add_dependency(
        &self,
        activity: ActivityId,
        depends_on: ActivityId,
        kind: DependencyType,
    ) -> WorkflowResult<Dependency> {
        if activity == depends_on {
            return Err(WorkflowError::SelfDependency(activity));
        }
        let _graph = self.graph_lock.lock().await;
        let dependent = self.activity(activity).await?;
        let predecessor = self.activity(depends_on).await?;
        if dependent.workflow_id != predecessor.workflow_id {
            return Err(WorkflowError::Validation(
                "dependencies must link activities of the same workflow".into(),
            ));
        }

        let existing = self
            .store
            .workflow_dependencies(dependent.workflow_id)
            .await?;
        DependencyGraph::from_dependencies(&existing).check_edge(activity, depends_on)?;

        let dependency = Dependency {
            id: DependencyId::new(),
            activity_id: activity,
            depends_on_id: depends_on,
            dependency_type: kind,
            created_at: self.clock.now(),
        };
        self.store.insert_dependency(dependency.clone()).await?;
        self.settle_readiness(activity).await?;
        info!(%activity, %depends_on, kind = %kind, "dependency added");
        Ok(dependency)
    }

    #[instrument(skip(self))]
    pub async fn remove_dependency(&self, id: DependencyId) -> WorkflowResult<Dependency> {
        let _graph = self.graph_lock.lock().await;
        let dependency = self
            .store
            .get_dependency(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("dependency", id))?;
        self.store.delete_dependency(id).await?;
        self.settle_readiness(dependency.activity_id).await?;
        info!(dependency = %id, "dependency removed");
        Ok(dependency)
    }

    /// Edges where `activity` is the dependent
    pub async fn dependencies_of(&self, activity: ActivityId) -> WorkflowResult<Vec<Dependency>> {
        self.activity(activity).await?;
        Ok(self.store.dependencies_of(activity).await?)
    }

    /// The workflow's dependency graph
    pub async fn dependency_graph(&self, workflow: WorkflowId) -> WorkflowResult<DependencyGraph> {
        let deps = self.store.workflow_dependencies(workflow).await?;
        Ok(DependencyGraph::from_dependencies(&deps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rdp_types::{ActivityType, ManualClock};

    fn ctx(state: WorkflowState) -> ActivityContext {
        ActivityContext {
            now: Utc::now(),
            workflow_state: state,
            dependencies: Vec::new(),
            predecessors: HashMap::new(),
            approved_reviews: 0,
        }
    }

    fn bare_activity(kind: ActivityType, status: ActivityStatus) -> Activity {
        let now = Utc::now();
        Activity {
            id: ActivityId::new(),
            workflow_id: WorkflowId::new(),
            project_id: ProjectId::new(),
            parent_id: None,
            name: "a".into(),
            description: String::new(),
            activity_type: kind,
            status,
            sequence: 0,
            priority: 0,
            progress: 0,
            assignee_id: None,
            planned_start: None,
            planned_end: None,
            actual_start: None,
            actual_end: None,
            creator_id: PrincipalId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[test]
    fn start_requires_executing_workflow() {
        let mut a = bare_activity(ActivityType::Task, ActivityStatus::Ready);
        let err = apply_activity_transition(&mut a, ActivityStatus::Running, &ctx(WorkflowState::Paused))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotExecuting { state: "paused" }));
        assert_eq!(a.status, ActivityStatus::Ready);
    }

    #[test]
    fn completion_sets_progress_and_end() {
        let mut a = bare_activity(ActivityType::Task, ActivityStatus::Running);
        a.progress = 40;
        apply_activity_transition(&mut a, ActivityStatus::Completed, &ctx(WorkflowState::Executing))
            .unwrap();
        assert_eq!(a.progress, 100);
        assert!(a.actual_end.is_some());
    }

    #[test]
    fn review_activity_needs_approved_review() {
        let mut a = bare_activity(ActivityType::Approval, ActivityStatus::Running);
        let err = apply_activity_transition(
            &mut a,
            ActivityStatus::Completed,
            &ctx(WorkflowState::Executing),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::ReviewRequired(_)));

        let mut approved = ctx(WorkflowState::Executing);
        approved.approved_reviews = 1;
        apply_activity_transition(&mut a, ActivityStatus::Completed, &approved).unwrap();
        assert_eq!(a.status, ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn workflow_entry_timestamps() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), clock.clone());
        let wf = engine
            .create_workflow(NewWorkflow::new(ProjectId::new(), "wf", PrincipalId::new()))
            .await
            .unwrap();
        engine.transition_workflow(wf.id, WorkflowState::Planning).await.unwrap();
        let executing = engine
            .transition_workflow(wf.id, WorkflowState::Executing)
            .await
            .unwrap();
        let started = executing.started_at.unwrap();

        clock.advance(std::time::Duration::from_secs(5));
        engine.transition_workflow(wf.id, WorkflowState::Paused).await.unwrap();
        let resumed = engine
            .transition_workflow(wf.id, WorkflowState::Executing)
            .await
            .unwrap();
        assert_eq!(resumed.started_at, Some(started));

        let cancelled = engine
            .transition_workflow(wf.id, WorkflowState::Cancelled)
            .await
            .unwrap();
        assert!(cancelled.completed_at.unwrap() >= started);
    }

    #[tokio::test]
    async fn progress_updates_roll_up() {
        let engine = WorkflowEngine::new(Arc::new(MemoryStore::new()), rdp_types::SystemClock::shared());
        let owner = PrincipalId::new();
        let wf = engine
            .create_workflow(NewWorkflow::new(ProjectId::new(), "wf", owner))
            .await
            .unwrap();
        let a = engine
            .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
            .await
            .unwrap();
        let b = engine
            .create_activity(NewActivity::new(wf.id, "b", ActivityType::Task, owner))
            .await
            .unwrap();
        engine.update_progress(a.id, 45).await.unwrap();
        engine.update_progress(b.id, 100).await.unwrap();
        assert_eq!(engine.workflow(wf.id).await.unwrap().progress, 72);
        assert_eq!(engine.activity(b.id).await.unwrap().status, ActivityStatus::Pending);

        let err = engine.update_progress(a.id, 101).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(engine.activity(a.id).await.unwrap().progress, 45);
    }

    #[tokio::test]
    async fn start_sees_a_pause_that_lands_while_it_waits() {
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(MemoryStore::new()),
            rdp_types::SystemClock::shared(),
        ));
        let owner = PrincipalId::new();
        let wf = engine
            .create_workflow(NewWorkflow::new(ProjectId::new(), "wf", owner))
            .await
            .unwrap();
        engine.transition_workflow(wf.id, WorkflowState::Planning).await.unwrap();
        engine.transition_workflow(wf.id, WorkflowState::Executing).await.unwrap();
        let a = engine
            .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
            .await
            .unwrap();

        let held = engine.lock_lifecycle(wf.id).await;
        let starting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start_activity(a.id).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!starting.is_finished());

        let mut paused = engine.workflow(wf.id).await.unwrap();
        paused.state = WorkflowState::Paused;
        engine.store().update_workflow(paused).await.unwrap();
        drop(held);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotExecuting { state: "paused" }));
        assert_ne!(engine.activity(a.id).await.unwrap().status, ActivityStatus::Running);
    }
}
