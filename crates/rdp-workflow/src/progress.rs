//! Workflow progress aggregation
//!
//! Workflow progress is the integer floor of the mean progress of its
//! top-level activities (those without a parent). A skipped activity counts
//! as 100 whatever its own progress. An empty workflow is at 0.
//! The aggregator never changes workflow state; it only reports.

use serde::Serialize;

use rdp_types::{Activity, ActivityStatus};

/// Snapshot of a workflow's activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressReport {
    /// floor(mean(top-level progress)), skipped counted as 100
    pub progress: u8,
    /// Top-level activities counted
    pub total: usize,
    /// Completed or approved
    pub finished: usize,
    /// Running or under review
    pub active: usize,
    /// Ready to start
    pub ready: usize,
    pub blocked: usize,
    pub skipped: usize,
    /// Nothing can move without outside intervention
    pub stalled: bool,
}

impl ProgressReport {
    /// Every top-level activity is finished or skipped
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.total > 0 && self.finished + self.skipped == self.total
    }
}

/// Aggregate the top-level activities of one workflow
#[must_use]
pub fn aggregate<'a>(activities: impl IntoIterator<Item = &'a Activity>) -> ProgressReport {
    let mut report = ProgressReport::default();
    let mut sum: u64 = 0;
    let mut pending = 0usize;

    for activity in activities.into_iter().filter(|a| a.parent_id.is_none()) {
        report.total += 1;
        sum += match activity.status {
            ActivityStatus::Skipped => 100,
            _ => u64::from(activity.progress.min(100)),
        };
        match activity.status {
            ActivityStatus::Completed | ActivityStatus::Approved => report.finished += 1,
            ActivityStatus::Running | ActivityStatus::Reviewing => report.active += 1,
            ActivityStatus::Ready => report.ready += 1,
            ActivityStatus::Blocked => report.blocked += 1,
            ActivityStatus::Skipped => report.skipped += 1,
            ActivityStatus::Pending | ActivityStatus::Rejected => pending += 1,
        }
    }

    if report.total > 0 {
        // bounded by 100, so the cast cannot truncate
        report.progress = u8::try_from(sum / report.total as u64).unwrap_or(100);
    }
    report.stalled = !report.all_done()
        && report.total > 0
        && report.active == 0
        && report.ready == 0
        && (report.blocked > 0 || pending > 0);
    report
}
