//! In-process walkthrough of the workflow happy path
//!
//! Drives one workflow from draft to completed through the engine, with two
//! activities joined by a finish-to-start edge. Used by the `scenario`
//! subcommand and as a smoke test of a freshly built portal.

use serde::Serialize;
use tracing::info;

use rdp_types::{
    ActivityType, DependencyType, NewActivity, NewWorkflow, PrincipalId, ProjectId, Workflow,
    WorkflowState,
};
use rdp_workflow::WorkflowError;

use crate::error::{KernelError, KernelResult};
use crate::portal::Portal;

/// What the walkthrough observed
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub workflow: Workflow,
    /// One line per step, in order
    pub steps: Vec<String>,
    /// The gated start was refused with unmet dependencies
    pub gate_held: bool,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.gate_held
            && self.workflow.state == WorkflowState::Completed
            && self.workflow.progress == 100
            && self.workflow.started_at.is_some()
            && self.workflow.completed_at.is_some()
    }
}

/// Run the happy path against `portal`'s engine
pub async fn happy_path(portal: &Portal) -> KernelResult<ScenarioReport> {
    let engine = portal.engine();
    let creator = PrincipalId::new();
    let mut steps = Vec::new();

    let wf = engine
        .create_workflow(NewWorkflow::new(ProjectId::new(), "happy path", creator))
        .await?;
    steps.push(format!("created workflow {} in {}", wf.id, wf.state));

    for to in [WorkflowState::Planning, WorkflowState::Executing] {
        let wf = engine.transition_workflow(wf.id, to).await?;
        steps.push(format!("workflow -> {}", wf.state));
    }

    let a1 = engine
        .create_activity(NewActivity::new(wf.id, "A1", ActivityType::Task, creator))
        .await?;
    let a2 = engine
        .create_activity(NewActivity::new(wf.id, "A2", ActivityType::Task, creator))
        .await?;
    engine
        .add_dependency(a2.id, a1.id, DependencyType::FinishToStart)
        .await?;
    steps.push("A2 depends on A1 (finish_to_start)".into());

    engine.start_activity(a1.id).await?;
    steps.push("A1 started".into());

    let gate_held = match engine.start_activity(a2.id).await {
        Err(WorkflowError::DependenciesUnmet { unmet, .. }) => {
            steps.push(format!("A2 refused, {} unmet", unmet.len()));
            true
        }
        Err(err) => return Err(err.into()),
        Ok(_) => {
            steps.push("A2 started before A1 finished".into());
            false
        }
    };

    engine.complete_activity(a1.id).await?;
    steps.push("A1 completed".into());
    if gate_held {
        engine.start_activity(a2.id).await?;
        steps.push("A2 started".into());
    }
    engine.complete_activity(a2.id).await?;
    steps.push("A2 completed".into());

    for to in [WorkflowState::Reviewing, WorkflowState::Completed] {
        let wf = engine.transition_workflow(wf.id, to).await?;
        steps.push(format!("workflow -> {}", wf.state));
    }

    let workflow = engine.workflow(wf.id).await?;
    if workflow.progress != 100 {
        return Err(KernelError::Unexpected(format!(
            "completed workflow reports {}% progress",
            workflow.progress
        )));
    }
    info!(workflow = %workflow.id, steps = steps.len(), "scenario finished");

    Ok(ScenarioReport {
        workflow,
        steps,
        gate_held,
    })
}
