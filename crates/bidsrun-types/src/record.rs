//! Run records — one per unit that left the planned state.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::unit::Unit;

/// Lifecycle state of a dispatched unit.
///
/// `Submitted` and `Running` are cluster-side transient states; everything
/// else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Container exited zero and expected outputs were found (local).
    Success,
    /// Container spawn failed or exited non-zero.
    FailedContainer,
    /// Container exited zero but no expected output was found.
    FailedOutputCheck,
    /// The completion oracle said "done" before dispatch.
    SkippedAlreadyDone,
    /// Local unit interrupted before completion.
    Cancelled,
    /// Cluster job accepted by the scheduler.
    Submitted,
    /// Scheduler submit command failed or returned no job id.
    SubmitFailed,
    /// Cluster job observed running.
    Running,
    /// Cluster job finished and outputs were found.
    Succeeded,
    /// Cluster job finished without expected outputs.
    Failed,
    /// Cluster job cancelled before it started.
    CancelledSubmitted,
    /// Cluster job cancelled while running.
    CancelledRunning,
}

impl UnitState {
    /// True when the unit will not change state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnitState::Submitted | UnitState::Running)
    }

    /// True for states that make the whole run exit non-zero.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitState::FailedContainer
                | UnitState::FailedOutputCheck
                | UnitState::SubmitFailed
                | UnitState::Failed
                | UnitState::Cancelled
                | UnitState::CancelledSubmitted
                | UnitState::CancelledRunning
        )
    }

    /// Stable label used in logs and the summary.
    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Success => "success",
            UnitState::FailedContainer => "failed_container",
            UnitState::FailedOutputCheck => "failed_output_check",
            UnitState::SkippedAlreadyDone => "skipped_already_done",
            UnitState::Cancelled => "cancelled",
            UnitState::Submitted => "submitted",
            UnitState::SubmitFailed => "submit_failed",
            UnitState::Running => "running",
            UnitState::Succeeded => "succeeded",
            UnitState::Failed => "failed",
            UnitState::CancelledSubmitted => "cancelled_submitted",
            UnitState::CancelledRunning => "cancelled_running",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The record written for every unit that left the planned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub unit: Unit,
    pub state: UnitState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Container (or job script) exit code, when one was observed.
    pub exit_code: Option<i32>,
    /// Per-unit log file, when one was written.
    pub log_path: Option<PathBuf>,
    /// Scratch directory retained for debugging after a failure.
    pub scratch_kept: Option<PathBuf>,
    /// Scheduler job id (cluster backend only).
    pub job_id: Option<String>,
}

impl RunRecord {
    /// A fresh record in the given state with no timing information.
    pub fn new(unit: Unit, state: UnitState) -> Self {
        Self {
            unit,
            state,
            started_at: None,
            finished_at: None,
            exit_code: None,
            log_path: None,
            scratch_kept: None,
            job_id: None,
        }
    }

    /// Record for a unit skipped because the oracle said "done".
    pub fn skipped(unit: Unit) -> Self {
        Self::new(unit, UnitState::SkippedAlreadyDone)
    }
}
