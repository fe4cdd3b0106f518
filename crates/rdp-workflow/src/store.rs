//! Persistence seam for the workflow engine
//!
//! Rows carry a `version`. `update_*` writes only when the stored version
//! equals the version the caller read, then bumps it; otherwise it reports
//! [`StoreError::VersionConflict`] and the engine re-reads and re-validates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use rdp_types::{
    Activity, ActivityId, Dependency, DependencyId, ProjectId, Review, ReviewId, Workflow,
    WorkflowId,
};

use crate::error::StoreError;

/// Rows removed by a cascading workflow delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct CascadeSummary {
    pub activities: usize,
    pub dependencies: usize,
    pub reviews: usize,
}

/// Storage for workflows and everything they own
#[async_trait]
pub trait WorkflowStore: Send + Sync + std::fmt::Debug {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError>;
    /// Newest first
    async fn list_workflows(&self, project: Option<ProjectId>) -> Result<Vec<Workflow>, StoreError>;
    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, StoreError>;
    /// Remove the workflow with its activities, their dependencies and reviews
    async fn delete_workflow(&self, id: WorkflowId) -> Result<CascadeSummary, StoreError>;

    async fn insert_activity(&self, activity: Activity) -> Result<(), StoreError>;
    async fn get_activity(&self, id: ActivityId) -> Result<Option<Activity>, StoreError>;
    /// Ordered by sequence, then id
    async fn list_activities(&self, workflow: WorkflowId) -> Result<Vec<Activity>, StoreError>;
    async fn update_activity(&self, activity: Activity) -> Result<Activity, StoreError>;

    async fn insert_dependency(&self, dependency: Dependency) -> Result<(), StoreError>;
    async fn get_dependency(&self, id: DependencyId) -> Result<Option<Dependency>, StoreError>;
    async fn delete_dependency(&self, id: DependencyId) -> Result<bool, StoreError>;
    /// Edges where `activity` is the dependent
    async fn dependencies_of(&self, activity: ActivityId) -> Result<Vec<Dependency>, StoreError>;
    /// Edges where `activity` is the predecessor
    async fn dependents_of(&self, activity: ActivityId) -> Result<Vec<Dependency>, StoreError>;
    /// Every edge between activities of one workflow
    async fn workflow_dependencies(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<Dependency>, StoreError>;

    async fn insert_review(&self, review: Review) -> Result<(), StoreError>;
    async fn get_review(&self, id: ReviewId) -> Result<Option<Review>, StoreError>;
    /// Newest first
    async fn list_reviews(&self, activity: ActivityId) -> Result<Vec<Review>, StoreError>;
    async fn update_review(&self, review: Review) -> Result<Review, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    workflows: BTreeMap<WorkflowId, Workflow>,
    activities: BTreeMap<ActivityId, Activity>,
    dependencies: BTreeMap<DependencyId, Dependency>,
    reviews: BTreeMap<ReviewId, Review>,
}

/// In-process store; every operation is atomic under one lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create new empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

trait Versioned: Clone {
    const ENTITY: &'static str;
    fn version_mut(&mut self) -> &mut u64;
}

impl Versioned for Workflow {
    const ENTITY: &'static str = "workflow";
    fn version_mut(&mut self) -> &mut u64 {
        &mut self.version
    }
}

impl Versioned for Activity {
    const ENTITY: &'static str = "activity";
    fn version_mut(&mut self) -> &mut u64 {
        &mut self.version
    }
}

impl Versioned for Review {
    const ENTITY: &'static str = "review";
    fn version_mut(&mut self) -> &mut u64 {
        &mut self.version
    }
}

/// Compare-and-swap on the version stamp
fn bump<T: Versioned>(id: String, stored: Option<&mut T>, mut incoming: T) -> Result<T, StoreError> {
    let Some(stored) = stored else {
        return Err(StoreError::Missing {
            entity: T::ENTITY,
            id,
        });
    };
    if *stored.version_mut() != *incoming.version_mut() {
        return Err(StoreError::VersionConflict {
            entity: T::ENTITY,
            id,
        });
    }
    *incoming.version_mut() += 1;
    *stored = incoming.clone();
    Ok(incoming)
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        self.tables.write().workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.tables.read().workflows.get(&id).cloned())
    }

    async fn list_workflows(&self, project: Option<ProjectId>) -> Result<Vec<Workflow>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .workflows
            .values()
            .rev()
            .filter(|w| project.map_or(true, |p| w.project_id == p))
            .cloned()
            .collect())
    }

    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        let mut tables = self.tables.write();
        let id = workflow.id;
        bump(id.to_string(), tables.workflows.get_mut(&id), workflow)
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<CascadeSummary, StoreError> {
        let mut tables = self.tables.write();
        if tables.workflows.remove(&id).is_none() {
            return Err(StoreError::Missing {
                entity: "workflow",
                id: id.to_string(),
            });
        }
        let doomed: Vec<ActivityId> = tables
            .activities
            .values()
            .filter(|a| a.workflow_id == id)
            .map(|a| a.id)
            .collect();

        let mut summary = CascadeSummary::default();
        for activity in &doomed {
            tables.activities.remove(activity);
            summary.activities += 1;
        }
        let before = tables.dependencies.len();
        tables
            .dependencies
            .retain(|_, d| !doomed.contains(&d.activity_id) && !doomed.contains(&d.depends_on_id));
        summary.dependencies = before - tables.dependencies.len();
        let before = tables.reviews.len();
        tables.reviews.retain(|_, r| !doomed.contains(&r.activity_id));
        summary.reviews = before - tables.reviews.len();
        Ok(summary)
    }

    async fn insert_activity(&self, activity: Activity) -> Result<(), StoreError> {
        self.tables.write().activities.insert(activity.id, activity);
        Ok(())
    }

    async fn get_activity(&self, id: ActivityId) -> Result<Option<Activity>, StoreError> {
        Ok(self.tables.read().activities.get(&id).cloned())
    }

    async fn list_activities(&self, workflow: WorkflowId) -> Result<Vec<Activity>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<Activity> = tables
            .activities
            .values()
            .filter(|a| a.workflow_id == workflow)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.sequence, a.id));
        Ok(rows)
    }

    async fn update_activity(&self, activity: Activity) -> Result<Activity, StoreError> {
        let mut tables = self.tables.write();
        let id = activity.id;
        bump(id.to_string(), tables.activities.get_mut(&id), activity)
    }

    async fn insert_dependency(&self, dependency: Dependency) -> Result<(), StoreError> {
        self.tables
            .write()
            .dependencies
            .insert(dependency.id, dependency);
        Ok(())
    }

    async fn get_dependency(&self, id: DependencyId) -> Result<Option<Dependency>, StoreError> {
        Ok(self.tables.read().dependencies.get(&id).cloned())
    }

    async fn delete_dependency(&self, id: DependencyId) -> Result<bool, StoreError> {
        Ok(self.tables.write().dependencies.remove(&id).is_some())
    }

    async fn dependencies_of(&self, activity: ActivityId) -> Result<Vec<Dependency>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .dependencies
            .values()
            .filter(|d| d.activity_id == activity)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, activity: ActivityId) -> Result<Vec<Dependency>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .dependencies
            .values()
            .filter(|d| d.depends_on_id == activity)
            .cloned()
            .collect())
    }

    async fn workflow_dependencies(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<Dependency>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .dependencies
            .values()
            .filter(|d| {
                tables
                    .activities
                    .get(&d.activity_id)
                    .is_some_and(|a| a.workflow_id == workflow)
            })
            .cloned()
            .collect())
    }

    async fn insert_review(&self, review: Review) -> Result<(), StoreError> {
        self.tables.write().reviews.insert(review.id, review);
        Ok(())
    }

    async fn get_review(&self, id: ReviewId) -> Result<Option<Review>, StoreError> {
        Ok(self.tables.read().reviews.get(&id).cloned())
    }

    async fn list_reviews(&self, activity: ActivityId) -> Result<Vec<Review>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .reviews
            .values()
            .rev()
            .filter(|r| r.activity_id == activity)
            .cloned()
            .collect())
    }

    async fn update_review(&self, review: Review) -> Result<Review, StoreError> {
        let mut tables = self.tables.write();
        let id = review.id;
        bump(id.to_string(), tables.reviews.get_mut(&id), review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rdp_types::{PrincipalId, WorkflowState};

    fn workflow() -> Workflow {
        let now = Utc::now();
        Workflow {
            id: WorkflowId::new(),
            project_id: ProjectId::new(),
            template_id: None,
            name: "w".into(),
            description: String::new(),
            state: WorkflowState::Draft,
            progress: 0,
            started_at: None,
            completed_at: None,
            creator_id: PrincipalId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(wf.clone()).await.unwrap();

        let mut first = wf.clone();
        first.state = WorkflowState::Planning;
        let saved = store.update_workflow(first).await.unwrap();
        assert_eq!(saved.version, 1);

        let mut stale = wf;
        stale.state = WorkflowState::Cancelled;
        let err = store.update_workflow(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let current = store.get_workflow(saved.id).await.unwrap().unwrap();
        assert_eq!(current.state, WorkflowState::Planning);
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let store = MemoryStore::new();
        let a = workflow();
        let b = workflow();
        store.insert_workflow(a.clone()).await.unwrap();
        store.insert_workflow(b.clone()).await.unwrap();
        let ids: Vec<_> = store
            .list_workflows(None)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert!(store
            .list_workflows(Some(ProjectId::new()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_workflow_is_missing() {
        let store = MemoryStore::new();
        let err = store.delete_workflow(WorkflowId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing { .. }));
    }
}
