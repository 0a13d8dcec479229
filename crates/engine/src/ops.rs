//! Read and manual-fix operations over the audit ledger, for operator tooling.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use runway_storage::{views, AuditEntry, AuditEntryIssue, AuditLedger, AuditState};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::error::EngineError;
use crate::runner::{hostname, new_execution_id};

/// Author recorded on entries written by a manual fix.
pub const OPS_AUTHOR: &str = "runway-cli";

/// How an operator resolved an open issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// The change's effect is in place; treat it as applied.
    Applied,
    /// The change's effect is gone; run it again next time.
    RolledBack,
}

impl Resolution {
    pub fn state(self) -> AuditState {
        match self {
            Resolution::Applied => AuditState::ManualMarkedAsApplied,
            Resolution::RolledBack => AuditState::ManualMarkedAsRolledBack,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Applied => "applied",
            Resolution::RolledBack => "rolled-back",
        })
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "applied" => Ok(Resolution::Applied),
            "rolled-back" | "rolledback" => Ok(Resolution::RolledBack),
            other => Err(format!(
                "unknown resolution '{other}' (expected 'applied' or 'rolled-back')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixOutcome {
    /// The resolution entry appended to the ledger.
    Recorded { entry: Box<AuditEntry> },
    NoIssueFound { change_id: String },
}

pub struct OpsClient {
    ledger: Arc<dyn AuditLedger>,
}

impl OpsClient {
    pub fn new(ledger: Arc<dyn AuditLedger>) -> Self {
        Self { ledger }
    }

    pub async fn history(&self) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.ledger.history().await?)
    }

    pub async fn change_history(&self, change_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(views::history_for(&self.ledger.history().await?, change_id))
    }

    pub async fn snapshot(&self) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.ledger.snapshot().await?)
    }

    /// Snapshot entries written at or after `since`.
    pub async fn snapshot_since(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(views::snapshot_since(&self.ledger.history().await?, since))
    }

    pub async fn issues(&self) -> Result<Vec<AuditEntryIssue>, EngineError> {
        Ok(self.ledger.issues().await?)
    }

    pub async fn issue_by_change_id(
        &self,
        change_id: &str,
    ) -> Result<Option<AuditEntryIssue>, EngineError> {
        Ok(self.ledger.issue_by_change_id(change_id).await?)
    }

    /// Close the open issue of `change_id` by appending a manual terminal
    /// entry. Earlier entries are left untouched.
    pub async fn fix_issue(
        &self,
        change_id: &str,
        resolution: Resolution,
    ) -> Result<FixOutcome, EngineError> {
        let Some(issue) = self.ledger.issue_by_change_id(change_id).await? else {
            return Ok(FixOutcome::NoIssueFound {
                change_id: change_id.to_string(),
            });
        };

        let entry = AuditEntry {
            execution_id: new_execution_id(),
            author: OPS_AUTHOR.to_string(),
            created_at: OffsetDateTime::now_utc(),
            state: resolution.state(),
            duration_millis: 0,
            execution_hostname: hostname(),
            error_trace: None,
            ..issue.entry
        };
        self.ledger.append(&entry).await?;
        info!(change_id, %resolution, "issue resolved manually");
        Ok(FixOutcome::Recorded {
            entry: Box::new(entry),
        })
    }
}
