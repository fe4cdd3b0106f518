use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rdp_types::{
    ActivityStatus, ActivityType, DependencyType, NewActivity, NewReview, NewWorkflow, PageRequest,
    PrincipalId, ProjectId, ReviewType, SystemClock, Workflow, WorkflowState,
};
use rdp_workflow::{
    MemoryStore, ReviewCoordinator, TransitionError, WorkflowEngine, WorkflowError,
    WorkflowFilter,
};

fn engine() -> Arc<WorkflowEngine> {
    Arc::new(WorkflowEngine::new(
        Arc::new(MemoryStore::new()),
        SystemClock::shared(),
    ))
}

async fn executing_workflow(engine: &WorkflowEngine, owner: PrincipalId) -> Workflow {
    let wf = engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "chip bring-up", owner))
        .await
        .unwrap();
    engine
        .transition_workflow(wf.id, WorkflowState::Planning)
        .await
        .unwrap();
    engine
        .transition_workflow(wf.id, WorkflowState::Executing)
        .await
        .unwrap()
}

#[tokio::test]
async fn workflow_happy_path() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "W", owner))
        .await
        .unwrap();
    assert_eq!(wf.state, WorkflowState::Draft);

    engine
        .transition_workflow(wf.id, WorkflowState::Planning)
        .await
        .unwrap();
    let wf = engine
        .transition_workflow(wf.id, WorkflowState::Executing)
        .await
        .unwrap();
    assert!(wf.started_at.is_some());

    let a1 = engine
        .create_activity(NewActivity::new(wf.id, "A1", ActivityType::Task, owner).with_sequence(1))
        .await
        .unwrap();
    let a2 = engine
        .create_activity(NewActivity::new(wf.id, "A2", ActivityType::Task, owner).with_sequence(2))
        .await
        .unwrap();
    engine
        .add_dependency(a2.id, a1.id, DependencyType::FinishToStart)
        .await
        .unwrap();

    engine.start_activity(a1.id).await.unwrap();
    let err = engine.start_activity(a2.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::DependenciesUnmet { ref unmet, .. } if unmet == &vec![a1.id]));
    assert!(err.to_string().contains("dependencies unmet"));

    engine.complete_activity(a1.id).await.unwrap();
    assert_eq!(
        engine.activity(a2.id).await.unwrap().status,
        ActivityStatus::Ready
    );
    let started = engine.start_activity(a2.id).await.unwrap();
    assert!(started.actual_start.is_some());
    let done = engine.complete_activity(a2.id).await.unwrap();
    assert!(done.actual_start.unwrap() <= done.actual_end.unwrap());

    engine
        .transition_workflow(wf.id, WorkflowState::Reviewing)
        .await
        .unwrap();
    let wf = engine
        .transition_workflow(wf.id, WorkflowState::Completed)
        .await
        .unwrap();
    assert!(wf.completed_at.is_some());
    assert_eq!(wf.progress, 100);
}

#[tokio::test]
async fn completed_workflow_refuses_transitions() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    engine
        .transition_workflow(wf.id, WorkflowState::Reviewing)
        .await
        .unwrap();
    engine
        .transition_workflow(wf.id, WorkflowState::Completed)
        .await
        .unwrap();

    let err = engine
        .transition_workflow(wf.id, WorkflowState::Executing)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WorkflowError::Transition(TransitionError::TerminalState { state: "completed" })
    );
    assert_eq!(err.kind(), rdp_types::ErrorKind::Conflict);
    assert_eq!(
        engine.workflow(wf.id).await.unwrap().state,
        WorkflowState::Completed
    );
}

#[tokio::test]
async fn dependency_cycle_is_rejected() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    let mut ids = Vec::new();
    for name in ["A", "B", "C"] {
        let act = engine
            .create_activity(NewActivity::new(wf.id, name, ActivityType::Task, owner))
            .await
            .unwrap();
        ids.push(act.id);
    }
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    engine.add_dependency(a, b, DependencyType::FinishToStart).await.unwrap();
    engine.add_dependency(b, c, DependencyType::FinishToStart).await.unwrap();

    let err = engine
        .add_dependency(c, a, DependencyType::FinishToStart)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DependencyCycle { .. }));
    assert_eq!(err.kind(), rdp_types::ErrorKind::Validation);
    assert!(engine.dependencies_of(c).await.unwrap().is_empty());
    assert_eq!(engine.dependency_graph(wf.id).await.unwrap().edge_count(), 2);
}

#[tokio::test]
async fn dependency_rules() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    let other = executing_workflow(&engine, owner).await;
    let a = engine
        .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
        .await
        .unwrap();
    let b = engine
        .create_activity(NewActivity::new(wf.id, "b", ActivityType::Task, owner))
        .await
        .unwrap();
    let foreign = engine
        .create_activity(NewActivity::new(other.id, "x", ActivityType::Task, owner))
        .await
        .unwrap();

    assert!(matches!(
        engine.add_dependency(a.id, a.id, DependencyType::FinishToStart).await,
        Err(WorkflowError::SelfDependency(_))
    ));
    assert!(matches!(
        engine.add_dependency(a.id, foreign.id, DependencyType::FinishToStart).await,
        Err(WorkflowError::Validation(_))
    ));
    let dep = engine
        .add_dependency(b.id, a.id, DependencyType::StartToStart)
        .await
        .unwrap();
    let dup = engine
        .add_dependency(b.id, a.id, DependencyType::FinishToStart)
        .await
        .unwrap_err();
    assert_eq!(dup.kind(), rdp_types::ErrorKind::Conflict);

    // start_to_start: b may start once a runs
    assert!(engine.start_activity(b.id).await.is_err());
    engine.start_activity(a.id).await.unwrap();
    assert_eq!(engine.activity(b.id).await.unwrap().status, ActivityStatus::Pending);
    engine.start_activity(b.id).await.unwrap();

    engine.remove_dependency(dep.id).await.unwrap();
    assert!(engine.dependencies_of(b.id).await.unwrap().is_empty());
    assert!(matches!(
        engine.remove_dependency(dep.id).await,
        Err(WorkflowError::NotFound { .. })
    ));
}

#[tokio::test]
async fn finish_to_finish_gates_completion_only() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    let pred = engine
        .create_activity(NewActivity::new(wf.id, "pred", ActivityType::Task, owner))
        .await
        .unwrap();
    let dep = engine
        .create_activity(NewActivity::new(wf.id, "dep", ActivityType::Task, owner))
        .await
        .unwrap();
    engine
        .add_dependency(dep.id, pred.id, DependencyType::FinishToFinish)
        .await
        .unwrap();

    engine.start_activity(dep.id).await.unwrap();
    assert!(matches!(
        engine.complete_activity(dep.id).await,
        Err(WorkflowError::DependenciesUnmet { .. })
    ));
    engine.start_activity(pred.id).await.unwrap();
    engine.complete_activity(pred.id).await.unwrap();
    engine.complete_activity(dep.id).await.unwrap();
}

#[tokio::test]
async fn start_requires_executing_workflow() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "W", owner))
        .await
        .unwrap();
    let act = engine
        .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
        .await
        .unwrap();
    let err = engine.start_activity(act.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowNotExecuting { state: "draft" }));
    assert_eq!(engine.activity(act.id).await.unwrap().status, ActivityStatus::Pending);
}

#[tokio::test]
async fn block_unblock_skip() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    let pred = engine
        .create_activity(NewActivity::new(wf.id, "pred", ActivityType::Task, owner))
        .await
        .unwrap();
    let act = engine
        .create_activity(NewActivity::new(wf.id, "act", ActivityType::Task, owner))
        .await
        .unwrap();
    engine
        .add_dependency(act.id, pred.id, DependencyType::FinishToStart)
        .await
        .unwrap();

    engine.block_activity(act.id).await.unwrap();
    assert_eq!(
        engine.unblock_activity(act.id).await.unwrap().status,
        ActivityStatus::Pending
    );
    engine.skip_activity(pred.id).await.unwrap();
    assert!(engine.unblock_activity(act.id).await.is_err());

    let err = engine.assign(pred.id, Some(owner)).await.unwrap_err();
    assert!(err.is_transition());
    let assigned = engine.assign(act.id, Some(owner)).await.unwrap();
    assert_eq!(assigned.assignee_id, Some(owner));
}

#[tokio::test]
async fn delete_cascades_to_owned_rows() {
    let engine = engine();
    let reviews = ReviewCoordinator::new(engine.clone());
    let owner = PrincipalId::new();
    let wf = executing_workflow(&engine, owner).await;
    let a = engine
        .create_activity(NewActivity::new(wf.id, "a", ActivityType::Review, owner))
        .await
        .unwrap();
    let b = engine
        .create_activity(NewActivity::new(wf.id, "b", ActivityType::Task, owner))
        .await
        .unwrap();
    engine.add_dependency(b.id, a.id, DependencyType::FinishToStart).await.unwrap();
    let review = reviews
        .open(NewReview::new(a.id, ReviewType::Dcp, owner))
        .await
        .unwrap();

    let summary = engine.delete_workflow(wf.id).await.unwrap();
    assert_eq!(summary.activities, 2);
    assert_eq!(summary.dependencies, 1);
    assert_eq!(summary.reviews, 1);
    assert!(matches!(engine.workflow(wf.id).await, Err(WorkflowError::NotFound { .. })));
    assert!(matches!(engine.activity(a.id).await, Err(WorkflowError::NotFound { .. })));
    assert!(matches!(reviews.review(review.id).await, Err(WorkflowError::NotFound { .. })));
}

#[tokio::test]
async fn listings_are_filtered_and_paged() {
    let engine = engine();
    let owner = PrincipalId::new();
    let project = ProjectId::new();
    let mut created = Vec::new();
    for i in 0..5 {
        let wf = engine
            .create_workflow(NewWorkflow::new(project, format!("wf-{i}"), owner))
            .await
            .unwrap();
        created.push(wf.id);
    }
    engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "elsewhere", owner))
        .await
        .unwrap();

    let filter = WorkflowFilter {
        project_id: Some(project),
        state: None,
    };
    let page = engine
        .list_workflows(filter, PageRequest::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, created[4]);

    let available = engine.available_transitions(created[0]).await.unwrap();
    assert_eq!(available, vec![WorkflowState::Planning, WorkflowState::Cancelled]);

    let wf = executing_workflow(&engine, owner).await;
    for (seq, name) in [(3, "c"), (1, "a"), (2, "b")] {
        engine
            .create_activity(NewActivity::new(wf.id, name, ActivityType::Task, owner).with_sequence(seq))
            .await
            .unwrap();
    }
    let names: Vec<String> = engine
        .list_activities(wf.id, None)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(engine
        .list_activities(wf.id, Some(ActivityStatus::Running))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_serialize() {
    let engine = engine();
    let owner = PrincipalId::new();
    let wf = engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "race", owner))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .transition_workflow(wf.id, WorkflowState::Planning)
                .await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(err) => assert!(err.is_transition(), "{err}"),
        }
    }
    assert_eq!(ok, 1);
    let wf = engine.workflow(wf.id).await.unwrap();
    assert_eq!(wf.state, WorkflowState::Planning);
    assert_eq!(wf.version, 1);
}

proptest! {
    #[test]
    fn unmet_finish_to_start_blocks_start(pred_steps in 0usize..2) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let engine = engine();
            let owner = PrincipalId::new();
            let wf = executing_workflow(&engine, owner).await;
            let pred = engine
                .create_activity(NewActivity::new(wf.id, "p", ActivityType::Task, owner))
                .await
                .unwrap();
            let act = engine
                .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
                .await
                .unwrap();
            engine
                .add_dependency(act.id, pred.id, DependencyType::FinishToStart)
                .await
                .unwrap();
            // leave the predecessor pending or running
            if pred_steps == 1 {
                engine.start_activity(pred.id).await.unwrap();
            }
            let blocked = matches!(
                engine.start_activity(act.id).await,
                Err(WorkflowError::DependenciesUnmet { .. })
            );
            prop_assert!(blocked);
            Ok(())
        })?;
    }

    #[test]
    fn workflow_progress_tracks_floor_mean(values in prop::collection::vec(0u32..=100, 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let engine = engine();
            let owner = PrincipalId::new();
            let wf = executing_workflow(&engine, owner).await;
            let mut sum = 0u32;
            for (n, value) in values.iter().enumerate() {
                let act = engine
                    .create_activity(NewActivity::new(wf.id, "a", ActivityType::Task, owner))
                    .await
                    .unwrap();
                let act = engine.update_progress(act.id, *value).await.unwrap();
                prop_assert!(act.progress <= 100);
                sum += value;
                let expected = sum / (n as u32 + 1);
                let progress = engine.workflow(wf.id).await.unwrap().progress;
                prop_assert_eq!(u32::from(progress), expected);
            }
            Ok(())
        })?;
    }
}
