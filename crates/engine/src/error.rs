use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

use runway_storage::{StorageError, TxType};
use time::OffsetDateTime;

/// Top-level error returned by the planner and the ops client.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    ManualIntervention(#[from] ManualInterventionRequired),

    #[error(transparent)]
    TargetSystemResolution(#[from] TargetSystemResolutionError),

    #[error("audit ledger error: {0}")]
    Ledger(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("change '{change_id}' appears more than once in the pipeline")]
    DuplicateChange { change_id: String },
}

// ──────────────────────────────────────────────
// Lock
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailureKind {
    AcquisitionTimeout,
    AlreadyOwned,
    RefreshFailed,
    ReleaseFailed,
    Expired,
    ProcessInterrupted,
    Unknown,
}

impl LockFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockFailureKind::AcquisitionTimeout => "ACQUISITION_TIMEOUT",
            LockFailureKind::AlreadyOwned => "ALREADY_OWNED",
            LockFailureKind::RefreshFailed => "REFRESH_FAILED",
            LockFailureKind::ReleaseFailed => "RELEASE_FAILED",
            LockFailureKind::Expired => "EXPIRED",
            LockFailureKind::ProcessInterrupted => "PROCESS_INTERRUPTED",
            LockFailureKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LockFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure to obtain or keep the distributed lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockError {
    pub kind: LockFailureKind,
    pub key: String,
    pub owner: String,
    /// Holder observed by the last failed attempt, when known.
    pub current_owner: Option<String>,
    pub attempts: u32,
    pub waited_millis: u64,
    pub expires_at: Option<OffsetDateTime>,
    pub cause: Option<String>,
}

impl LockError {
    pub(crate) fn new(kind: LockFailureKind, key: &str, owner: &str) -> Self {
        Self {
            kind,
            key: key.to_string(),
            owner: owner.to_string(),
            current_owner: None,
            attempts: 0,
            waited_millis: 0,
            expires_at: None,
            cause: None,
        }
    }

    pub(crate) fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock '{}' failure {} for runner '{}'",
            self.key, self.kind, self.owner
        )?;
        if let Some(holder) = &self.current_owner {
            write!(f, ", held by '{holder}'")?;
        }
        if self.attempts > 0 {
            write!(
                f,
                " after {} attempt(s) over {}ms",
                self.attempts, self.waited_millis
            )?;
        }
        if let Some(expires_at) = self.expires_at {
            write!(f, ", lease expiry {expires_at}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for LockError {}

// ──────────────────────────────────────────────
// Manual intervention
// ──────────────────────────────────────────────

/// One change blocked on an operator decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedChange {
    pub change_id: String,
    pub stage_id: String,
    pub state: runway_storage::AuditState,
}

/// Raised before any execution when changes are left in a state the engine
/// will not resolve on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualInterventionRequired {
    pub blocked: Vec<BlockedChange>,
}

impl fmt::Display for ManualInterventionRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} change(s) require manual intervention before the run can proceed:",
            self.blocked.len()
        )?;
        for b in &self.blocked {
            writeln!(
                f,
                "  - '{}' (stage '{}') is {}; resolve with `runway fix {} --resolution applied|rolled-back`",
                b.change_id, b.stage_id, b.state, b.change_id
            )?;
        }
        Ok(())
    }
}

impl StdError for ManualInterventionRequired {}

// ──────────────────────────────────────────────
// Target systems
// ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("change '{change_id}' targets unknown system '{target_system_id}' (registered: {available:?}); {suggestion}")]
pub struct TargetSystemResolutionError {
    pub change_id: String,
    pub target_system_id: String,
    pub available: Vec<String>,
    pub suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Active,
    Committed,
    Aborted,
    Unknown,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::NotStarted => "not started",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
            TransactionState::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    NotAttempted,
    Succeeded,
    Failed,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RollbackStatus::NotAttempted => "not attempted",
            RollbackStatus::Succeeded => "succeeded",
            RollbackStatus::Failed => "failed",
        })
    }
}

/// A failure inside a target system's transaction machinery, as opposed to
/// a failure of the change's own code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("target system '{target_system_id}' failed to {operation} (transaction {transaction_state}, rollback {rollback_status}): {message}")]
pub struct TargetSystemError {
    pub target_system_id: String,
    pub operation: String,
    pub transaction_state: TransactionState,
    pub rollback_status: RollbackStatus,
    pub message: String,
}

impl TargetSystemError {
    pub fn new(target_system_id: &str, operation: &str, message: impl Into<String>) -> Self {
        Self {
            target_system_id: target_system_id.to_string(),
            operation: operation.to_string(),
            transaction_state: TransactionState::Unknown,
            rollback_status: RollbackStatus::NotAttempted,
            message: message.into(),
        }
    }

    pub fn with_state(mut self, state: TransactionState) -> Self {
        self.transaction_state = state;
        self
    }

    pub fn with_rollback(mut self, status: RollbackStatus) -> Self {
        self.rollback_status = status;
        self
    }
}

// ──────────────────────────────────────────────
// Change execution
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Apply,
    Rollback,
    Transaction,
    AuditWrite,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionPhase::Apply => "apply",
            ExecutionPhase::Rollback => "rollback",
            ExecutionPhase::Transaction => "transaction",
            ExecutionPhase::AuditWrite => "audit write",
        })
    }
}

/// Every failure of a change, whatever its origin, normalized into one shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("change '{change_id}' failed in stage '{stage_id}' during {phase} ({tx_type}, {duration_millis}ms, target system '{target_system_id}'): {message}")]
pub struct ChangeExecutionError {
    pub stage_id: String,
    pub change_id: String,
    pub tx_type: TxType,
    pub duration_millis: u64,
    pub target_system_id: String,
    pub phase: ExecutionPhase,
    /// Innermost cause of the failure.
    pub message: String,
    /// The whole cause chain, outermost first, as recorded in the audit entry.
    pub trace: String,
}

/// The innermost message and the full chain of an error.
pub(crate) fn describe_error(err: &(dyn StdError + 'static)) -> (String, String) {
    let mut lines = vec![err.to_string()];
    let mut root = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        root = cause.to_string();
        lines.push(format!("caused by: {cause}"));
        current = cause.source();
    }
    (root, lines.join("\n"))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
