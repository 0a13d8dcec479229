use std::fmt;

use serde::Serialize;

use crate::error::{ChangeExecutionError, LockError};
use crate::navigator::{ChangeOutcome, ChangeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Failed,
    /// The lock could not be acquired and the run was configured to degrade.
    LockUnavailable,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::LockUnavailable => "LOCK_UNAVAILABLE",
        })
    }
}

/// Per-stage counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage_id: String,
    pub applied: usize,
    pub already_applied: usize,
    pub failed: usize,
    pub not_reached: usize,
}

/// What one run did, change by change.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub runner_id: String,
    /// Set once the run starts executing changes.
    pub execution_id: Option<String>,
    pub status: RunStatus,
    pub outcomes: Vec<ChangeOutcome>,
    pub stages: Vec<StageSummary>,
    /// Changes a previous runner left marked in flight.
    pub interrupted_changes: Vec<String>,
    pub lock_error: Option<LockError>,
}

impl RunSummary {
    pub(crate) fn new(runner_id: &str, stages: Vec<(String, usize)>) -> Self {
        Self {
            runner_id: runner_id.to_string(),
            execution_id: None,
            status: RunStatus::Completed,
            outcomes: Vec::new(),
            stages: stages
                .into_iter()
                .map(|(stage_id, changes)| StageSummary {
                    stage_id,
                    not_reached: changes,
                    ..StageSummary::default()
                })
                .collect(),
            interrupted_changes: Vec::new(),
            lock_error: None,
        }
    }

    pub(crate) fn record(&mut self, outcome: ChangeOutcome) {
        if let Some(stage) = self
            .stages
            .iter_mut()
            .find(|s| s.stage_id == outcome.stage_id)
        {
            stage.not_reached = stage.not_reached.saturating_sub(1);
            match outcome.status {
                ChangeStatus::Applied => stage.applied += 1,
                ChangeStatus::AlreadyApplied => stage.already_applied += 1,
                ChangeStatus::Failed => stage.failed += 1,
            }
        }
        if outcome.is_failed() {
            self.status = RunStatus::Failed;
        }
        self.outcomes.push(outcome);
    }

    pub(crate) fn lock_unavailable(mut self, error: LockError) -> Self {
        self.status = RunStatus::LockUnavailable;
        self.lock_error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn applied_count(&self) -> usize {
        self.count(ChangeStatus::Applied)
    }

    pub fn already_applied_count(&self) -> usize {
        self.count(ChangeStatus::AlreadyApplied)
    }

    pub fn failed_count(&self) -> usize {
        self.count(ChangeStatus::Failed)
    }

    pub fn outcome(&self, change_id: &str) -> Option<&ChangeOutcome> {
        self.outcomes.iter().find(|o| o.change_id == change_id)
    }

    /// The change that stopped the run.
    pub fn failure(&self) -> Option<&ChangeExecutionError> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }

    fn count(&self, status: ChangeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run {} (runner {}", self.status, self.runner_id)?;
        if let Some(id) = &self.execution_id {
            write!(f, ", execution {id}")?;
        }
        writeln!(f, ")")?;

        if let Some(err) = &self.lock_error {
            writeln!(f, "  lock: {err}")?;
        }
        for stage in &self.stages {
            writeln!(
                f,
                "  stage '{}': {} applied, {} already applied, {} failed, {} not reached",
                stage.stage_id, stage.applied, stage.already_applied, stage.failed, stage.not_reached
            )?;
        }
        for outcome in self.outcomes.iter().filter(|o| o.is_failed()) {
            if let Some(err) = &outcome.error {
                writeln!(f, "  FAILED {err}")?;
            }
            writeln!(f, "    rollback: {:?}", outcome.rollback)?;
            if let Some(rb) = &outcome.rollback_error {
                writeln!(f, "    rollback error: {rb}")?;
            }
        }
        let audit_failures: usize = self.outcomes.iter().map(|o| o.audit_failures.len()).sum();
        if audit_failures > 0 {
            writeln!(f, "  {audit_failures} audit entr(ies) could not be written")?;
        }
        if !self.interrupted_changes.is_empty() {
            writeln!(
                f,
                "  left in flight by a previous runner: {}",
                self.interrupted_changes.join(", ")
            )?;
        }
        Ok(())
    }
}
