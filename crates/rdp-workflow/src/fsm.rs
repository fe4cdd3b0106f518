//! Transition tables
//!
//! One declarative table per lifecycle. `can_transition`, `check_transition`
//! and the CLI matrix all read the same table, so there is no second place
//! where legality is decided.

use std::fmt;

use rdp_types::{ActivityStatus, ReviewStatus, WorkflowState};

use crate::error::TransitionError;

/// A closed set of states with an explicit successor table
pub trait Lifecycle: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Name of the lifecycle, used in logs and matrices
    const NAME: &'static str;

    /// Every state, in display order
    fn states() -> &'static [Self];

    /// Legal targets from `self`
    fn successors(self) -> &'static [Self];

    /// Wire label of the state
    fn label(self) -> &'static str;

    /// No outbound transitions
    #[inline]
    fn is_final(self) -> bool {
        self.successors().is_empty()
    }

    /// Whether `self -> to` appears in the table
    #[inline]
    fn can_transition(self, to: Self) -> bool {
        self.successors().contains(&to)
    }

    /// Validate `self -> to`, classifying the refusal
    fn check_transition(self, to: Self) -> Result<(), TransitionError> {
        if self == to {
            return Err(TransitionError::AlreadyInState { state: self.label() });
        }
        if self.is_final() {
            return Err(TransitionError::TerminalState { state: self.label() });
        }
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(TransitionError::IllegalTransition {
                from: self.label(),
                to: to.label(),
            })
        }
    }
}

impl Lifecycle for WorkflowState {
    const NAME: &'static str = "workflow";

    fn states() -> &'static [Self] {
        Self::ALL
    }

    fn successors(self) -> &'static [Self] {
        use WorkflowState::*;
        match self {
            Draft => &[Planning, Cancelled],
            Planning => &[Executing, Paused, Cancelled],
            Executing => &[Reviewing, Paused, Cancelled],
            Reviewing => &[Executing, Completed, Cancelled],
            Paused => &[Executing, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    fn label(self) -> &'static str {
        self.as_str()
    }
}

impl Lifecycle for ActivityStatus {
    const NAME: &'static str = "activity";

    fn states() -> &'static [Self] {
        Self::ALL
    }

    fn successors(self) -> &'static [Self] {
        use ActivityStatus::*;
        match self {
            Pending => &[Ready, Running, Blocked, Skipped],
            Ready => &[Pending, Running, Blocked, Skipped],
            Running => &[Completed, Reviewing, Blocked],
            Reviewing => &[Approved, Rejected, Running],
            Rejected => &[Running],
            Blocked => &[Pending, Ready],
            Completed | Approved | Skipped => &[],
        }
    }

    fn label(self) -> &'static str {
        self.as_str()
    }
}

impl Lifecycle for ReviewStatus {
    const NAME: &'static str = "review";

    fn states() -> &'static [Self] {
        Self::ALL
    }

    fn successors(self) -> &'static [Self] {
        use ReviewStatus::*;
        match self {
            Pending => &[Submitted],
            Submitted => &[Approved, Rejected, Revision],
            Revision => &[Submitted],
            Approved | Rejected => &[],
        }
    }

    fn label(self) -> &'static str {
        self.as_str()
    }
}

/// One row of a rendered transition matrix
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MatrixRow {
    pub from: &'static str,
    pub to: Vec<&'static str>,
    pub terminal: bool,
}

/// Render a lifecycle's table as rows
#[must_use]
pub fn matrix<L: Lifecycle>() -> Vec<MatrixRow> {
    L::states()
        .iter()
        .map(|state| MatrixRow {
            from: state.label(),
            to: state.successors().iter().map(|s| s.label()).collect(),
            terminal: state.is_final(),
        })
        .collect()
}

/// Render a lifecycle's table as a fixed-width grid
#[must_use]
pub fn render_grid<L: Lifecycle>() -> String {
    let states = L::states();
    let width = states.iter().map(|s| s.label().len()).max().unwrap_or(0) + 2;
    let mut out = format!("{:width$}", L::NAME);
    for to in states {
        out.push_str(&format!("{:width$}", to.label()));
    }
    out.push('\n');
    for from in states {
        out.push_str(&format!("{:width$}", from.label()));
        for to in states {
            let cell = if from == to {
                "-"
            } else if from.can_transition(*to) {
                "x"
            } else {
                "."
            };
            out.push_str(&format!("{cell:width$}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn workflow_table_matches_lifecycle() {
        use WorkflowState::*;
        assert!(Draft.can_transition(Planning));
        assert!(Reviewing.can_transition(Executing));
        assert!(!Draft.can_transition(Executing));
        assert!(!Paused.can_transition(Reviewing));
        assert_eq!(
            Completed.check_transition(Executing),
            Err(TransitionError::TerminalState { state: "completed" })
        );
        assert_eq!(
            Draft.check_transition(Draft),
            Err(TransitionError::AlreadyInState { state: "draft" })
        );
    }

    #[test]
    fn terminal_sets_agree_with_types() {
        for state in WorkflowState::ALL {
            assert_eq!(state.is_final(), state.is_terminal(), "{state}");
        }
        for status in ActivityStatus::ALL {
            assert_eq!(status.is_final(), status.is_terminal(), "{status}");
        }
        assert!(ReviewStatus::Approved.is_final());
        assert!(ReviewStatus::Rejected.is_final());
        assert!(!ReviewStatus::Revision.is_final());
    }

    #[test]
    fn matrix_lists_every_state() {
        let rows = matrix::<WorkflowState>();
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].from, "draft");
        assert_eq!(rows[0].to, vec!["planning", "cancelled"]);
        assert!(rows.iter().filter(|r| r.terminal).count() == 2);
    }

    #[test]
    fn grid_marks_legal_cells() {
        let grid = render_grid::<ReviewStatus>();
        let lines: Vec<&str> = grid.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("review"));
        assert!(lines[1].starts_with("pending"));
        assert!(lines[1].contains('x'));
    }
}
