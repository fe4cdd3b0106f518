//! Activity dependency graph and gate resolution
//!
//! Edges point from the dependent activity to its predecessor. Insertion
//! refuses self loops and any edge whose predecessor can already reach the
//! dependent, so the graph stays a DAG after every successful insert.

use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use rdp_types::{ActivityId, ActivityStatus, Dependency, DependencyType};

use crate::error::{WorkflowError, WorkflowResult};

/// Directed graph of one workflow's dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    inner: DiGraphMap<ActivityId, DependencyType>,
}

impl DependencyGraph {
    /// Create new empty graph
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from existing edges
    #[must_use]
    pub fn from_dependencies<'a>(deps: impl IntoIterator<Item = &'a Dependency>) -> Self {
        let mut graph = Self::new();
        for dep in deps {
            graph
                .inner
                .add_edge(dep.activity_id, dep.depends_on_id, dep.dependency_type);
        }
        graph
    }

    /// Check that `activity -> depends_on` may be added
    pub fn check_edge(&self, activity: ActivityId, depends_on: ActivityId) -> WorkflowResult<()> {
        if activity == depends_on {
            return Err(WorkflowError::SelfDependency(activity));
        }
        if self.inner.contains_edge(activity, depends_on) {
            return Err(WorkflowError::DuplicateDependency {
                activity,
                depends_on,
            });
        }
        if self.inner.contains_node(activity)
            && self.inner.contains_node(depends_on)
            && has_path_connecting(&self.inner, depends_on, activity, None)
        {
            return Err(WorkflowError::DependencyCycle {
                activity,
                depends_on,
            });
        }
        Ok(())
    }

    /// Add an edge after [`Self::check_edge`]
    pub fn add_edge(
        &mut self,
        activity: ActivityId,
        depends_on: ActivityId,
        kind: DependencyType,
    ) -> WorkflowResult<()> {
        self.check_edge(activity, depends_on)?;
        self.inner.add_edge(activity, depends_on, kind);
        Ok(())
    }

    /// Drop an edge, returning whether it existed
    pub fn remove_edge(&mut self, activity: ActivityId, depends_on: ActivityId) -> bool {
        self.inner.remove_edge(activity, depends_on).is_some()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.inner)
    }

    /// Activities that directly depend on `predecessor`
    #[must_use]
    pub fn dependents(&self, predecessor: ActivityId) -> Vec<ActivityId> {
        self.inner
            .neighbors_directed(predecessor, Direction::Incoming)
            .collect()
    }

    /// Predecessors first; `None` only if the graph is cyclic
    #[must_use]
    pub fn execution_order(&self) -> Option<Vec<ActivityId>> {
        toposort(&self.inner, None).ok().map(|mut order| {
            order.reverse();
            order
        })
    }
}

/// Which family of gates to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// finish_to_start and start_to_start
    Start,
    /// finish_to_finish and start_to_finish
    Finish,
}

impl Gate {
    fn applies_to(self, kind: DependencyType) -> bool {
        match self {
            Self::Start => kind.gates_start(),
            Self::Finish => !kind.gates_start(),
        }
    }
}

/// Outcome of a gate evaluation
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct Readiness {
    /// Predecessors whose state does not yet satisfy their edge
    pub unmet: Vec<ActivityId>,
}

impl Readiness {
    #[inline]
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.unmet.is_empty()
    }
}

/// Evaluate gates for one activity.
///
/// `deps` are the activity's own edges; `status_of` reports predecessor
/// state. A predecessor that cannot be found counts as unmet.
pub fn resolve<F>(deps: &[Dependency], gate: Gate, status_of: F) -> Readiness
where
    F: Fn(ActivityId) -> Option<ActivityStatus>,
{
    let unmet = deps
        .iter()
        .filter(|dep| gate.applies_to(dep.dependency_type))
        .filter(|dep| {
            !status_of(dep.depends_on_id).is_some_and(|s| dep.dependency_type.satisfied_by(s))
        })
        .map(|dep| dep.depends_on_id)
        .collect();
    Readiness { unmet }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rdp_types::DependencyId;
    use std::collections::HashMap;

    fn dep(activity: ActivityId, on: ActivityId, kind: DependencyType) -> Dependency {
        Dependency {
            id: DependencyId::new(),
            activity_id: activity,
            depends_on_id: on,
            dependency_type: kind,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_self_loop_and_duplicate() {
        let a = ActivityId::new();
        let b = ActivityId::new();
        let mut graph = DependencyGraph::new();
        assert!(matches!(
            graph.check_edge(a, a),
            Err(WorkflowError::SelfDependency(_))
        ));
        graph.add_edge(b, a, DependencyType::FinishToStart).unwrap();
        assert!(matches!(
            graph.add_edge(b, a, DependencyType::StartToStart),
            Err(WorkflowError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn rejects_closing_edge_of_chain() {
        let (a, b, c) = (ActivityId::new(), ActivityId::new(), ActivityId::new());
        let mut graph = DependencyGraph::new();
        graph.add_edge(a, b, DependencyType::FinishToStart).unwrap();
        graph.add_edge(b, c, DependencyType::FinishToStart).unwrap();
        let err = graph.add_edge(c, a, DependencyType::FinishToStart).unwrap_err();
        assert!(matches!(err, WorkflowError::DependencyCycle { .. }));
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.is_acyclic());
    }

    #[test]
    fn execution_order_puts_predecessors_first() {
        let (a, b, c) = (ActivityId::new(), ActivityId::new(), ActivityId::new());
        let mut graph = DependencyGraph::new();
        graph.add_edge(c, b, DependencyType::FinishToStart).unwrap();
        graph.add_edge(b, a, DependencyType::FinishToStart).unwrap();
        assert_eq!(graph.execution_order().unwrap(), vec![a, b, c]);
        assert_eq!(graph.dependents(a), vec![b]);
    }

    #[test]
    fn resolve_splits_start_and_finish_gates() {
        let (me, p1, p2) = (ActivityId::new(), ActivityId::new(), ActivityId::new());
        let deps = vec![
            dep(me, p1, DependencyType::FinishToStart),
            dep(me, p2, DependencyType::FinishToFinish),
        ];
        let statuses: HashMap<_, _> =
            [(p1, ActivityStatus::Running), (p2, ActivityStatus::Running)].into();
        let start = resolve(&deps, Gate::Start, |id| statuses.get(&id).copied());
        assert_eq!(start.unmet, vec![p1]);
        let finish = resolve(&deps, Gate::Finish, |id| statuses.get(&id).copied());
        assert_eq!(finish.unmet, vec![p2]);

        let done: HashMap<_, _> =
            [(p1, ActivityStatus::Approved), (p2, ActivityStatus::Completed)].into();
        assert!(resolve(&deps, Gate::Start, |id| done.get(&id).copied()).is_satisfied());
        assert!(resolve(&deps, Gate::Finish, |id| done.get(&id).copied()).is_satisfied());
    }

    #[test]
    fn missing_predecessor_is_unmet() {
        let (me, gone) = (ActivityId::new(), ActivityId::new());
        let deps = vec![dep(me, gone, DependencyType::StartToStart)];
        assert!(!resolve(&deps, Gate::Start, |_| None).is_satisfied());
    }

    proptest! {
        #[test]
        fn accepted_edges_always_form_a_dag(
            edges in prop::collection::vec((0usize..8, 0usize..8), 0..40)
        ) {
            let nodes: Vec<ActivityId> = (0..8).map(|_| ActivityId::new()).collect();
            let mut graph = DependencyGraph::new();
            for (from, to) in edges {
                let _ = graph.add_edge(nodes[from], nodes[to], DependencyType::FinishToStart);
                prop_assert!(graph.is_acyclic());
            }
            prop_assert!(graph.execution_order().is_some());
        }
    }
}
