use std::sync::Arc;

use proptest::prelude::*;
use rdp_types::{
    ActivityStatus, NewWorkflow, PrincipalId, ProjectId, ReviewStatus, SystemClock, WorkflowState,
};
use rdp_workflow::{Lifecycle, MemoryStore, TransitionError, WorkflowEngine, WorkflowError};

fn workflow_state() -> impl Strategy<Value = WorkflowState> {
    prop_oneof![
        Just(WorkflowState::Draft),
        Just(WorkflowState::Planning),
        Just(WorkflowState::Executing),
        Just(WorkflowState::Reviewing),
        Just(WorkflowState::Paused),
        Just(WorkflowState::Completed),
        Just(WorkflowState::Cancelled),
    ]
}

fn activity_status() -> impl Strategy<Value = ActivityStatus> {
    prop::sample::select(ActivityStatus::ALL.to_vec())
}

fn review_status() -> impl Strategy<Value = ReviewStatus> {
    prop::sample::select(ReviewStatus::ALL.to_vec())
}

/// Shortest table path from draft
fn path_to(state: WorkflowState) -> Vec<WorkflowState> {
    use WorkflowState::*;
    match state {
        Draft => vec![],
        Planning => vec![Planning],
        Executing => vec![Planning, Executing],
        Reviewing => vec![Planning, Executing, Reviewing],
        Paused => vec![Planning, Paused],
        Completed => vec![Planning, Executing, Reviewing, Completed],
        Cancelled => vec![Cancelled],
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(Arc::new(MemoryStore::new()), SystemClock::shared())
}

#[test]
fn draft_transitions() {
    use WorkflowState::*;
    assert!(Draft.check_transition(Planning).is_ok());
    assert!(Draft.check_transition(Cancelled).is_ok());
    assert!(Draft.check_transition(Executing).is_err());
    assert!(Draft.check_transition(Completed).is_err());
}

#[test]
fn reviewing_can_return_to_executing() {
    use WorkflowState::*;
    assert!(Reviewing.check_transition(Executing).is_ok());
    assert!(Reviewing.check_transition(Completed).is_ok());
    assert!(Reviewing.check_transition(Paused).is_err());
}

#[test]
fn activity_terminals_have_no_exits() {
    for from in [ActivityStatus::Completed, ActivityStatus::Approved, ActivityStatus::Skipped] {
        for to in ActivityStatus::ALL {
            assert!(!from.can_transition(*to), "{from} -> {to}");
        }
    }
}

proptest! {
    #[test]
    fn workflow_transition_succeeds_iff_in_table(from in workflow_state(), to in workflow_state()) {
        let rt = runtime();
        rt.block_on(async {
            let engine = engine();
            let wf = engine
                .create_workflow(NewWorkflow::new(ProjectId::new(), "prop", PrincipalId::new()))
                .await
                .unwrap();
            for step in path_to(from) {
                engine.transition_workflow(wf.id, step).await.unwrap();
            }

            let result = engine.transition_workflow(wf.id, to).await;
            let after = engine.workflow(wf.id).await.unwrap();
            if from.successors().contains(&to) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(after.state, to);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(after.state, from);
                let err = result.unwrap_err();
                prop_assert!(err.is_transition());
                if from == to {
                    let expected = matches!(
                        err,
                        WorkflowError::Transition(TransitionError::AlreadyInState { .. })
                    );
                    prop_assert!(expected);
                } else if from.is_terminal() {
                    let expected = matches!(
                        err,
                        WorkflowError::Transition(TransitionError::TerminalState { .. })
                    );
                    prop_assert!(expected);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn workflow_timestamps_are_ordered(steps in prop::collection::vec(workflow_state(), 0..12)) {
        let rt = runtime();
        rt.block_on(async {
            let engine = engine();
            let wf = engine
                .create_workflow(NewWorkflow::new(ProjectId::new(), "prop", PrincipalId::new()))
                .await
                .unwrap();
            let mut first_start = None;
            for step in steps {
                let _ = engine.transition_workflow(wf.id, step).await;
                let now = engine.workflow(wf.id).await.unwrap();
                if first_start.is_none() {
                    first_start = now.started_at;
                }
                prop_assert_eq!(now.started_at, first_start);
                if let (Some(start), Some(end)) = (now.started_at, now.completed_at) {
                    prop_assert!(start <= end);
                }
                if now.state.is_terminal() {
                    prop_assert!(now.completed_at.is_some());
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn activity_check_matches_table(from in activity_status(), to in activity_status()) {
        let ok = from.check_transition(to).is_ok();
        prop_assert_eq!(ok, from.successors().contains(&to));
        if from.is_terminal() {
            prop_assert!(!ok);
        }
    }

    #[test]
    fn review_terminals_are_final(from in review_status(), to in review_status()) {
        let ok = from.check_transition(to).is_ok();
        prop_assert_eq!(ok, from.successors().contains(&to));
        if matches!(from, ReviewStatus::Approved | ReviewStatus::Rejected) {
            prop_assert!(!ok);
        }
    }
}
