//! Review coordinator
//!
//! Reviews follow `pending -> submitted -> {approved, rejected, revision}`,
//! with `revision -> submitted` for the next cycle. Decisions feed back into
//! the reviewed activity:
//! - submitting while the activity runs moves it to `reviewing`
//! - approval moves a reviewing activity to `approved`
//! - rejection and revision requests return it to `running`
//!
//! Activity side effects are best effort. The review decision stands even if
//! the activity cannot follow (for example an unmet finish gate); the
//! activity can be moved later through the engine.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use rdp_types::{
    ActivityId, ActivityStatus, NewReview, PrincipalId, Review, ReviewId, ReviewStatus,
};

use crate::engine::WorkflowEngine;
use crate::error::{StoreError, TransitionError, WorkflowError, WorkflowResult};
use crate::fsm::Lifecycle;

/// Largest accepted review score
pub const MAX_SCORE: u32 = 100;

/// Drives review lifecycles and their effect on activities
#[derive(Debug, Clone)]
pub struct ReviewCoordinator {
    engine: Arc<WorkflowEngine>,
    max_retries: u32,
}

impl ReviewCoordinator {
    /// Create new coordinator over an engine
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self {
            engine,
            max_retries: 8,
        }
    }

    /// Open a review; a finished or skipped activity takes no new reviews
    #[instrument(skip(self, input), fields(activity = %input.activity_id))]
    pub async fn open(&self, input: NewReview) -> WorkflowResult<Review> {
        let activity = self.engine.activity(input.activity_id).await?;
        if activity.status.is_terminal() {
            return Err(TransitionError::TerminalState {
                state: activity.status.as_str(),
            }
            .into());
        }
        let now = self.engine.clock().now();
        let review = Review {
            id: ReviewId::new(),
            activity_id: activity.id,
            project_id: activity.project_id,
            review_type: input.review_type,
            status: ReviewStatus::Pending,
            reviewer_id: input.reviewer_id,
            comments: input.comments,
            score: None,
            submitted_at: None,
            reviewed_at: None,
            creator_id: input.creator_id,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.engine.store().insert_review(review.clone()).await?;
        info!(review = %review.id, kind = %review.review_type, "review opened");
        Ok(review)
    }

    pub async fn review(&self, id: ReviewId) -> WorkflowResult<Review> {
        self.engine
            .store()
            .get_review(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("review", id))
    }

    /// Newest first
    pub async fn list(&self, activity: ActivityId) -> WorkflowResult<Vec<Review>> {
        self.engine.activity(activity).await?;
        Ok(self.engine.store().list_reviews(activity).await?)
    }

    async fn mutate<F>(&self, id: ReviewId, mut apply: F) -> WorkflowResult<Review>
    where
        F: FnMut(&mut Review) -> WorkflowResult<()> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut review = self.review(id).await?;
            apply(&mut review)?;
            review.updated_at = self.engine.clock().now();
            match self.engine.store().update_review(review).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict { entity, id: row }) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(WorkflowError::Contention { entity, id: row });
                    }
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Submit (or resubmit after a revision request) with comments and score
    #[instrument(skip(self, comments))]
    pub async fn submit(
        &self,
        id: ReviewId,
        comments: String,
        score: Option<u32>,
    ) -> WorkflowResult<Review> {
        let score = match score {
            Some(value) if value > MAX_SCORE => {
                return Err(WorkflowError::Validation(
                    "score must be between 0 and 100".into(),
                ))
            }
            Some(value) => u8::try_from(value).ok(),
            None => None,
        };
        let clock = self.engine.clock().clone();
        let review = self
            .mutate(id, |review| {
                review.status.check_transition(ReviewStatus::Submitted)?;
                review.status = ReviewStatus::Submitted;
                review.comments.clone_from(&comments);
                review.score = score;
                review.submitted_at = Some(clock.now());
                review.reviewed_at = None;
                Ok(())
            })
            .await?;
        info!(review = %id, "review submitted");
        self.follow(&review, ActivityStatus::Running, ActivityStatus::Reviewing)
            .await;
        Ok(review)
    }

    #[instrument(skip(self))]
    pub async fn approve(&self, id: ReviewId, reviewer: PrincipalId) -> WorkflowResult<Review> {
        let review = self.decide(id, ReviewStatus::Approved, reviewer).await?;
        self.follow(&review, ActivityStatus::Reviewing, ActivityStatus::Approved)
            .await;
        Ok(review)
    }

    /// Rejection returns the activity to `running` rather than `blocked`
    #[instrument(skip(self))]
    pub async fn reject(&self, id: ReviewId, reviewer: PrincipalId) -> WorkflowResult<Review> {
        let review = self.decide(id, ReviewStatus::Rejected, reviewer).await?;
        self.follow(&review, ActivityStatus::Reviewing, ActivityStatus::Running)
            .await;
        Ok(review)
    }

    #[instrument(skip(self))]
    pub async fn request_revision(
        &self,
        id: ReviewId,
        reviewer: PrincipalId,
    ) -> WorkflowResult<Review> {
        let review = self.decide(id, ReviewStatus::Revision, reviewer).await?;
        self.follow(&review, ActivityStatus::Reviewing, ActivityStatus::Running)
            .await;
        Ok(review)
    }

    async fn decide(
        &self,
        id: ReviewId,
        to: ReviewStatus,
        reviewer: PrincipalId,
    ) -> WorkflowResult<Review> {
        let clock = self.engine.clock().clone();
        let review = self
            .mutate(id, |review| {
                review.status.check_transition(to)?;
                review.status = to;
                review.reviewer_id = Some(reviewer);
                review.reviewed_at = Some(clock.now());
                Ok(())
            })
            .await?;
        info!(review = %id, decision = %to, %reviewer, "review decided");
        Ok(review)
    }

    /// Move the reviewed activity `from -> to` if it is currently in `from`
    async fn follow(&self, review: &Review, from: ActivityStatus, to: ActivityStatus) {
        let current = match self.engine.activity(review.activity_id).await {
            Ok(activity) => activity.status,
            Err(err) => {
                warn!(review = %review.id, error = %err, "reviewed activity unavailable");
                return;
            }
        };
        if current != from {
            return;
        }
        if let Err(err) = self
            .engine
            .transition_activity(review.activity_id, to)
            .await
        {
            warn!(
                review = %review.id,
                activity = %review.activity_id,
                to = %to,
                error = %err,
                "activity did not follow review decision"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rdp_types::{
        ActivityType, NewActivity, NewWorkflow, ProjectId, ReviewType, SystemClock, WorkflowState,
    };

    async fn running_activity(kind: ActivityType) -> (Arc<WorkflowEngine>, ActivityId) {
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(MemoryStore::new()),
            SystemClock::shared(),
        ));
        let owner = PrincipalId::new();
        let wf = engine
            .create_workflow(NewWorkflow::new(ProjectId::new(), "wf", owner))
            .await
            .unwrap();
        engine.transition_workflow(wf.id, WorkflowState::Planning).await.unwrap();
        engine.transition_workflow(wf.id, WorkflowState::Executing).await.unwrap();
        let act = engine
            .create_activity(NewActivity::new(wf.id, "review me", kind, owner))
            .await
            .unwrap();
        engine.start_activity(act.id).await.unwrap();
        (engine, act.id)
    }

    #[tokio::test]
    async fn approval_completes_review_activity() {
        let (engine, act) = running_activity(ActivityType::Review).await;
        let reviews = ReviewCoordinator::new(engine.clone());
        let owner = PrincipalId::new();
        let review = reviews
            .open(NewReview::new(act, ReviewType::Dcp, owner))
            .await
            .unwrap();

        let submitted = reviews
            .submit(review.id, "looks fine".into(), Some(90))
            .await
            .unwrap();
        assert!(submitted.submitted_at.is_some());
        assert!(submitted.reviewed_at.is_none());
        assert_eq!(engine.activity(act).await.unwrap().status, ActivityStatus::Reviewing);

        let approved = reviews.approve(review.id, owner).await.unwrap();
        assert!(approved.reviewed_at.is_some());
        let activity = engine.activity(act).await.unwrap();
        assert_eq!(activity.status, ActivityStatus::Approved);
        assert_eq!(activity.progress, 100);
        assert!(activity.actual_end.is_some());
    }

    #[tokio::test]
    async fn rejection_returns_activity_to_running() {
        let (engine, act) = running_activity(ActivityType::Approval).await;
        let reviews = ReviewCoordinator::new(engine.clone());
        let owner = PrincipalId::new();
        let review = reviews
            .open(NewReview::new(act, ReviewType::Final, owner))
            .await
            .unwrap();
        reviews.submit(review.id, String::new(), None).await.unwrap();
        let rejected = reviews.reject(review.id, owner).await.unwrap();
        assert_eq!(rejected.status, ReviewStatus::Rejected);
        assert_eq!(engine.activity(act).await.unwrap().status, ActivityStatus::Running);

        let err = reviews.approve(review.id, owner).await.unwrap_err();
        assert!(err.is_transition());

        let err = engine.complete_activity(act).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ReviewRequired(_)));
    }

    #[tokio::test]
    async fn revision_cycle_restamps_review() {
        let (engine, act) = running_activity(ActivityType::Task).await;
        let reviews = ReviewCoordinator::new(engine.clone());
        let owner = PrincipalId::new();
        let review = reviews
            .open(NewReview::new(act, ReviewType::Code, owner))
            .await
            .unwrap();
        reviews.submit(review.id, "v1".into(), Some(40)).await.unwrap();
        let revision = reviews.request_revision(review.id, owner).await.unwrap();
        assert_eq!(revision.status, ReviewStatus::Revision);
        assert!(revision.reviewed_at.is_some());
        assert_eq!(engine.activity(act).await.unwrap().status, ActivityStatus::Running);

        let resubmitted = reviews.submit(review.id, "v2".into(), Some(85)).await.unwrap();
        assert_eq!(resubmitted.status, ReviewStatus::Submitted);
        assert!(resubmitted.reviewed_at.is_none());
        assert_eq!(resubmitted.score, Some(85));
    }

    #[tokio::test]
    async fn score_out_of_range_is_rejected() {
        let (engine, act) = running_activity(ActivityType::Task).await;
        let reviews = ReviewCoordinator::new(engine);
        let review = reviews
            .open(NewReview::new(act, ReviewType::Doc, PrincipalId::new()))
            .await
            .unwrap();
        let err = reviews.submit(review.id, String::new(), Some(101)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(reviews.review(review.id).await.unwrap().status, ReviewStatus::Pending);
    }

    #[tokio::test]
    async fn decisions_require_submission() {
        let (engine, act) = running_activity(ActivityType::Task).await;
        let reviews = ReviewCoordinator::new(engine);
        let review = reviews
            .open(NewReview::new(act, ReviewType::Doc, PrincipalId::new()))
            .await
            .unwrap();
        let err = reviews.approve(review.id, PrincipalId::new()).await.unwrap_err();
        assert!(err.is_transition());
    }

    #[tokio::test]
    async fn finished_activities_take_no_new_reviews() {
        let (engine, act) = running_activity(ActivityType::Task).await;
        engine.complete_activity(act).await.unwrap();
        let reviews = ReviewCoordinator::new(engine.clone());

        let err = reviews
            .open(NewReview::new(act, ReviewType::Code, PrincipalId::new()))
            .await
            .unwrap_err();
        assert!(err.is_transition());
        assert_eq!(err.kind(), rdp_types::ErrorKind::Conflict);
        assert!(reviews.list(act).await.unwrap().is_empty());
    }
}
