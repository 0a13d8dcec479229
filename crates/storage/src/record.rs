use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// State recorded by one audit entry.
///
/// `Started` is the only non-terminal state written by the engine. The two
/// `ManualMarked*` states are only ever written by an operator fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditState {
    Started,
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
    ManualMarkedAsApplied,
    ManualMarkedAsRolledBack,
}

impl AuditState {
    /// True when a change whose latest entry is in this state must not run again.
    pub fn is_applied(self) -> bool {
        matches!(self, AuditState::Applied | AuditState::ManualMarkedAsApplied)
    }

    /// True when a change whose latest entry is in this state needs operator attention.
    pub fn is_issue(self) -> bool {
        matches!(
            self,
            AuditState::Started | AuditState::Failed | AuditState::RollbackFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditState::Started => "STARTED",
            AuditState::Applied => "APPLIED",
            AuditState::Failed => "FAILED",
            AuditState::RolledBack => "ROLLED_BACK",
            AuditState::RollbackFailed => "ROLLBACK_FAILED",
            AuditState::ManualMarkedAsApplied => "MANUAL_MARKED_AS_APPLIED",
            AuditState::ManualMarkedAsRolledBack => "MANUAL_MARKED_AS_ROLLED_BACK",
        }
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an entry was produced by running user code or by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    #[default]
    Execution,
    System,
}

/// How the change's effects related transactionally to the audit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    #[default]
    NonTx,
    TxShared,
    TxSeparateNoMarker,
}

impl TxType {
    pub fn is_transactional(self) -> bool {
        !matches!(self, TxType::NonTx)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxType::NonTx => "NON_TX",
            TxType::TxShared => "TX_SHARED",
            TxType::TxSeparateNoMarker => "TX_SEPARATE_NO_MARKER",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine may do with a change that was left in an unclear state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    #[default]
    ManualIntervention,
    AlwaysRetry,
}

impl RecoveryStrategy {
    pub fn is_always_retry(self) -> bool {
        matches!(self, RecoveryStrategy::AlwaysRetry)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::ManualIntervention => f.write_str("MANUAL_INTERVENTION"),
            RecoveryStrategy::AlwaysRetry => f.write_str("ALWAYS_RETRY"),
        }
    }
}

/// One immutable record of a state transition of one change attempt.
///
/// Entries are only ever appended. The current state of a change is the
/// state of its latest entry (see [`crate::views::snapshot`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Groups every entry written by one run attempt.
    pub execution_id: String,
    pub stage_id: String,
    pub change_id: String,
    pub author: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: AuditState,
    #[serde(default)]
    pub execution_type: ExecutionType,
    pub class_name: String,
    pub method_name: String,
    pub duration_millis: u64,
    pub execution_hostname: String,
    /// Opaque, change-supplied.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub system_change: bool,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub error_trace: Option<String>,
    #[serde(default)]
    pub tx_type: TxType,
    pub target_system_id: String,
    /// Sortable sequence token derived from the change ordering.
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub recovery_strategy: RecoveryStrategy,
    /// Whether the change declared itself transactional; `None` when it did not say.
    #[serde(default)]
    pub transaction_flag: Option<bool>,
}

/// A snapshot entry in a state that needs operator attention, with the
/// change's full history for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntryIssue {
    pub entry: AuditEntry,
    pub history: Vec<AuditEntry>,
}

impl AuditEntryIssue {
    pub fn change_id(&self) -> &str {
        &self.entry.change_id
    }

    pub fn state(&self) -> AuditState {
        self.entry.state
    }

    /// The most recent error trace recorded for the change, if any.
    pub fn error_trace(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find_map(|e| e.error_trace.as_deref().filter(|t| !t.is_empty()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    LockHeld,
}

/// The row a lock backend keeps for one lock key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    pub key: String,
    pub status: LockStatus,
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl LockEntry {
    pub fn held(key: &str, owner: &str, lease_millis: u64, now: OffsetDateTime) -> Self {
        Self {
            key: key.to_string(),
            status: LockStatus::LockHeld,
            owner: owner.to_string(),
            expires_at: lease_expiry(now, lease_millis),
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// A successful acquisition or extension of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub key: String,
    pub owner: String,
    pub acquired_for_millis: u64,
    pub expires_at: OffsetDateTime,
}

impl LockAcquisition {
    pub fn from_entry(entry: &LockEntry, acquired_for_millis: u64) -> Self {
        Self {
            key: entry.key.clone(),
            owner: entry.owner.clone(),
            acquired_for_millis,
            expires_at: entry.expires_at,
        }
    }
}

/// `now + lease_millis`, saturating instead of overflowing for absurd leases.
pub fn lease_expiry(now: OffsetDateTime, lease_millis: u64) -> OffsetDateTime {
    let millis = i64::try_from(lease_millis).unwrap_or(i64::MAX);
    now.saturating_add(Duration::milliseconds(millis))
}
