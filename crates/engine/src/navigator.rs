//! Drives one change through its execution state machine:
//!
//! ```text
//! Start ─► Executing ─► Success ──────────────────────────► Complete
//!   │          └──────► Failed ─► RollingBack ─► RolledBack ─┤
//!   │                     │            └──────► RollbackFailed
//!   │                     └─► (auto) RolledBack / RollbackFailed
//!   └─► AlreadyApplied ───────────────────────────────────────┘
//! ```
//!
//! Which audit entries are written, and when, depends on the [`Strategy`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use runway_storage::{AuditEntry, AuditState};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditFailure, AuditWriter, EntryFactory, ExecutionScope};
use crate::change::{Change, ChangeContext, ChangeError, Dependencies};
use crate::error::{
    describe_error, panic_message, ChangeExecutionError, ExecutionPhase, RollbackStatus,
    TargetSystemError,
};
use crate::lock::LockHealth;
use crate::strategy::Strategy;
use crate::target::{wrap_in_transaction, TargetSystem, TargetTransaction, TransactionFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigatorState {
    Start,
    Executing,
    Success,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
    AlreadyApplied,
    Complete,
}

impl fmt::Display for NavigatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Applied,
    AlreadyApplied,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The change did not fail.
    NotNeeded,
    /// The change failed and has no rollback.
    NotSupported,
    /// Nothing to undo, or undoing is not safe to attempt.
    NotAttempted,
    Succeeded,
    Failed,
}

/// Result of navigating one change.
#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub change_id: String,
    pub stage_id: String,
    pub target_system_id: String,
    /// `None` when the change was not executed.
    pub strategy: Option<Strategy>,
    pub status: ChangeStatus,
    pub rollback: RollbackOutcome,
    pub duration_millis: u64,
    pub error: Option<ChangeExecutionError>,
    pub target_error: Option<TargetSystemError>,
    pub rollback_error: Option<String>,
    pub audit_failures: Vec<AuditFailure>,
    pub transitions: Vec<NavigatorState>,
}

impl ChangeOutcome {
    fn new(
        change_id: &str,
        stage_id: &str,
        target_system_id: &str,
        strategy: Option<Strategy>,
    ) -> Self {
        Self {
            change_id: change_id.to_string(),
            stage_id: stage_id.to_string(),
            target_system_id: target_system_id.to_string(),
            strategy,
            status: ChangeStatus::Failed,
            rollback: RollbackOutcome::NotNeeded,
            duration_millis: 0,
            error: None,
            target_error: None,
            rollback_error: None,
            audit_failures: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Outcome of a change whose latest audit entry already marks it applied.
    pub(crate) fn skipped(change_id: &str, stage_id: &str, target_system_id: &str) -> Self {
        let mut out = Self::new(change_id, stage_id, target_system_id, None);
        out.transition(NavigatorState::Start);
        out.status = ChangeStatus::AlreadyApplied;
        out.transition(NavigatorState::AlreadyApplied);
        info!(change_id, "change already applied, skipping");
        out.transition(NavigatorState::Complete);
        out
    }

    pub fn is_failed(&self) -> bool {
        self.status == ChangeStatus::Failed
    }

    pub fn final_state(&self) -> Option<NavigatorState> {
        self.transitions
            .iter()
            .rev()
            .find(|s| **s != NavigatorState::Complete)
            .copied()
    }

    fn transition(&mut self, state: NavigatorState) {
        debug!(change_id = %self.change_id, stage_id = %self.stage_id, %state, "navigator transition");
        self.transitions.push(state);
    }
}

/// A change failure before it is placed in its stage/strategy context.
struct Failure {
    message: String,
    trace: String,
}

impl Failure {
    fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let (message, trace) = describe_error(err);
        Self { message, trace }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            trace: message.clone(),
            message,
        }
    }

    fn unaudited(failures: &[AuditFailure]) -> Self {
        let cause = failures
            .last()
            .map(|f| f.message.as_str())
            .unwrap_or("unknown audit failure");
        let message = format!("change succeeded but its APPLIED entry was not recorded: {cause}");
        Self {
            trace: message.clone(),
            message,
        }
    }
}

fn settle(result: Result<Result<(), ChangeError>, Box<dyn Any + Send>>) -> Result<(), Failure> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Failure::from_error(&e)),
        Err(payload) => Err(Failure::from_panic(payload)),
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Why a shared-transaction step did not commit.
enum SharedFailure {
    Change(Failure),
    Audit(TargetSystemError),
}

pub(crate) struct StepNavigator<'a> {
    pub change: &'a dyn Change,
    pub target: &'a dyn TargetSystem,
    pub strategy: Strategy,
    pub scope: &'a ExecutionScope,
    pub dependencies: &'a Dependencies,
    pub lock: &'a LockHealth,
    pub writer: &'a AuditWriter,
}

impl StepNavigator<'_> {
    pub async fn run(&self, already_applied: bool) -> ChangeOutcome {
        let descriptor = self.change.descriptor();
        if already_applied {
            return ChangeOutcome::skipped(&descriptor.id, &self.scope.stage_id, self.target.id());
        }

        let mut out = ChangeOutcome::new(
            &descriptor.id,
            &self.scope.stage_id,
            self.target.id(),
            Some(self.strategy),
        );
        out.transition(NavigatorState::Start);

        info!(
            change_id = %descriptor.id,
            stage_id = %self.scope.stage_id,
            target_system = self.target.id(),
            strategy = %self.strategy,
            "executing change"
        );

        let markers = self.target.ongoing_task_status();
        if let Some(repo) = &markers {
            if let Err(e) = repo.mark_in_flight(&descriptor.id).await {
                warn!(change_id = %descriptor.id, error = %e, "could not mark change in flight");
            }
        }

        match self.strategy {
            Strategy::NonTransactional => self.run_non_transactional(&mut out).await,
            Strategy::TransactionalSeparate => self.run_separate(&mut out).await,
            Strategy::TransactionalShared => self.run_shared(&mut out).await,
        }

        if let Some(repo) = &markers {
            if out.audit_failures.is_empty() {
                if let Err(e) = repo.clear(&descriptor.id).await {
                    warn!(change_id = %descriptor.id, error = %e, "could not clear in-flight marker");
                }
            } else {
                warn!(change_id = %descriptor.id, "outcome not fully audited; in-flight marker kept");
            }
        }

        match &out.error {
            Some(err) => error!(error = %err, rollback = ?out.rollback, "change failed"),
            None => info!(change_id = %descriptor.id, duration_millis = out.duration_millis, "change applied"),
        }
        out.transition(NavigatorState::Complete);
        out
    }

    async fn run_non_transactional(&self, out: &mut ChangeOutcome) {
        let factory = self.factory();
        self.audit(out, factory.entry(AuditState::Started, 0, None))
            .await;

        out.transition(NavigatorState::Executing);
        let started = Instant::now();
        let result = self.call_apply(None).await;
        let duration = elapsed_millis(started);
        out.duration_millis = duration;

        let (phase, failure) = match result {
            Ok(()) => {
                out.transition(NavigatorState::Success);
                if self
                    .audit(out, factory.entry(AuditState::Applied, duration, None))
                    .await
                {
                    out.status = ChangeStatus::Applied;
                    return;
                }
                out.transition(NavigatorState::Failed);
                (
                    ExecutionPhase::AuditWrite,
                    Failure::unaudited(&out.audit_failures),
                )
            }
            Err(failure) => {
                out.transition(NavigatorState::Failed);
                self.audit(
                    out,
                    factory.entry(AuditState::Failed, duration, Some(failure.trace.clone())),
                )
                .await;
                (ExecutionPhase::Apply, failure)
            }
        };
        out.status = ChangeStatus::Failed;
        out.error = Some(self.execution_error(phase, duration, failure));

        if !self.change.has_rollback() {
            out.rollback = RollbackOutcome::NotSupported;
            return;
        }

        out.transition(NavigatorState::RollingBack);
        let started = Instant::now();
        let result = self.call_rollback().await;
        let rollback_duration = elapsed_millis(started);
        match result {
            Ok(()) => {
                out.transition(NavigatorState::RolledBack);
                out.rollback = RollbackOutcome::Succeeded;
                self.audit(
                    out,
                    factory.entry(AuditState::RolledBack, rollback_duration, None),
                )
                .await;
            }
            Err(failure) => {
                out.transition(NavigatorState::RollbackFailed);
                out.rollback = RollbackOutcome::Failed;
                out.rollback_error = Some(failure.message);
                self.audit(
                    out,
                    factory.entry(
                        AuditState::RollbackFailed,
                        rollback_duration,
                        Some(failure.trace),
                    ),
                )
                .await;
            }
        }
    }

    async fn run_separate(&self, out: &mut ChangeOutcome) {
        let factory = self.factory();
        self.audit(out, factory.entry(AuditState::Started, 0, None))
            .await;

        out.transition(NavigatorState::Executing);
        let started = Instant::now();
        let result = wrap_in_transaction(self.target, |mut tx| async move {
            let result = self.call_apply(Some(tx.as_mut())).await;
            (tx, result)
        })
        .await;
        let duration = elapsed_millis(started);
        out.duration_millis = duration;

        match result {
            Ok(()) => {
                out.transition(NavigatorState::Success);
                if self
                    .audit(out, factory.entry(AuditState::Applied, duration, None))
                    .await
                {
                    out.status = ChangeStatus::Applied;
                    return;
                }
                // Committed but unrecorded: the STARTED entry and the marker stay behind.
                out.transition(NavigatorState::Failed);
                out.status = ChangeStatus::Failed;
                out.rollback = RollbackOutcome::NotAttempted;
                out.error = Some(self.execution_error(
                    ExecutionPhase::AuditWrite,
                    duration,
                    Failure::unaudited(&out.audit_failures),
                ));
            }
            Err(TransactionFailure::Operation {
                error: failure,
                rollback,
                abort_error,
            }) => {
                out.transition(NavigatorState::Failed);
                out.status = ChangeStatus::Failed;
                self.audit(
                    out,
                    factory.entry(AuditState::Failed, duration, Some(failure.trace.clone())),
                )
                .await;
                out.error = Some(self.execution_error(ExecutionPhase::Apply, duration, failure));
                self.record_transaction_rollback(out, &factory, rollback, abort_error)
                    .await;
            }
            Err(TransactionFailure::Infrastructure(target_error)) => {
                out.transition(NavigatorState::Failed);
                out.status = ChangeStatus::Failed;
                let failure = Failure::from_error(&target_error);
                self.audit(
                    out,
                    factory.entry(AuditState::Failed, duration, Some(failure.trace.clone())),
                )
                .await;
                out.error = Some(self.execution_error(
                    ExecutionPhase::Transaction,
                    duration,
                    failure,
                ));
                let rollback = target_error.rollback_status;
                let abort_error = (rollback == RollbackStatus::Failed).then(|| target_error.clone());
                out.target_error = Some(target_error);
                self.record_transaction_rollback(out, &factory, rollback, abort_error)
                    .await;
            }
        }
    }

    async fn run_shared(&self, out: &mut ChangeOutcome) {
        let factory = self.factory();
        out.transition(NavigatorState::Executing);
        let started = Instant::now();
        let staging = &factory;
        let result = wrap_in_transaction(self.target, |mut tx| async move {
            let started_entry = staging.entry(AuditState::Started, 0, None);
            if let Err(e) = tx.stage_audit(&started_entry).await {
                return (tx, Err(SharedFailure::Audit(e)));
            }
            if let Err(failure) = self.call_apply(Some(tx.as_mut())).await {
                return (tx, Err(SharedFailure::Change(failure)));
            }
            let applied = staging.entry(AuditState::Applied, elapsed_millis(started), None);
            let staged = tx.stage_audit(&applied).await.map_err(SharedFailure::Audit);
            (tx, staged)
        })
        .await;
        let duration = elapsed_millis(started);
        out.duration_millis = duration;

        let (phase, failure, rollback, abort_error) = match result {
            Ok(()) => {
                out.transition(NavigatorState::Success);
                out.status = ChangeStatus::Applied;
                return;
            }
            Err(TransactionFailure::Operation {
                error: SharedFailure::Change(failure),
                rollback,
                abort_error,
            }) => (ExecutionPhase::Apply, failure, rollback, abort_error),
            Err(TransactionFailure::Operation {
                error: SharedFailure::Audit(audit_error),
                rollback,
                abort_error,
            }) => (
                ExecutionPhase::AuditWrite,
                Failure::from_error(&audit_error),
                rollback,
                abort_error,
            ),
            Err(TransactionFailure::Infrastructure(target_error)) => {
                let failure = Failure::from_error(&target_error);
                let rollback = target_error.rollback_status;
                let abort_error = (rollback == RollbackStatus::Failed).then(|| target_error.clone());
                out.target_error = Some(target_error);
                (ExecutionPhase::Transaction, failure, rollback, abort_error)
            }
        };

        out.transition(NavigatorState::Failed);
        out.status = ChangeStatus::Failed;
        // The staged entries went down with the transaction; record the attempt directly.
        self.audit(out, factory.entry(AuditState::Started, 0, None))
            .await;
        self.audit(
            out,
            factory.entry(AuditState::Failed, duration, Some(failure.trace.clone())),
        )
        .await;
        out.error = Some(self.execution_error(phase, duration, failure));
        self.record_transaction_rollback(out, &factory, rollback, abort_error)
            .await;
    }

    /// Record what the transaction's abort did. No `RollingBack` step: the
    /// target system reverted the change on its own.
    async fn record_transaction_rollback(
        &self,
        out: &mut ChangeOutcome,
        factory: &EntryFactory<'_>,
        rollback: RollbackStatus,
        abort_error: Option<TargetSystemError>,
    ) {
        match rollback {
            RollbackStatus::Succeeded => {
                out.transition(NavigatorState::RolledBack);
                out.rollback = RollbackOutcome::Succeeded;
                self.audit(out, factory.entry(AuditState::RolledBack, 0, None))
                    .await;
            }
            RollbackStatus::Failed => {
                out.transition(NavigatorState::RollbackFailed);
                out.rollback = RollbackOutcome::Failed;
                let trace = abort_error.as_ref().map(|e| e.to_string());
                out.rollback_error = trace.clone();
                self.audit(out, factory.entry(AuditState::RollbackFailed, 0, trace))
                    .await;
            }
            RollbackStatus::NotAttempted => {
                out.rollback = RollbackOutcome::NotAttempted;
            }
        }
    }

    fn factory(&self) -> EntryFactory<'_> {
        EntryFactory {
            scope: self.scope,
            change: self.change.descriptor(),
            tx_type: self.strategy.tx_type(),
            target_system_id: self.target.id(),
        }
    }

    /// Append `entry`, recording a failure on the outcome. Returns whether it was written.
    async fn audit(&self, out: &mut ChangeOutcome, entry: AuditEntry) -> bool {
        match self.writer.write(&entry).await {
            Ok(()) => true,
            Err(failure) => {
                out.audit_failures.push(failure);
                false
            }
        }
    }

    async fn call_apply(
        &self,
        transaction: Option<&mut (dyn TargetTransaction + 'static)>,
    ) -> Result<(), Failure> {
        let descriptor = self.change.descriptor();
        let mut ctx = ChangeContext::new(
            &descriptor.id,
            &self.scope.stage_id,
            &self.scope.execution_id,
            self.dependencies,
            self.lock,
            transaction,
        );
        settle(
            AssertUnwindSafe(self.change.apply(&mut ctx))
                .catch_unwind()
                .await,
        )
    }

    async fn call_rollback(&self) -> Result<(), Failure> {
        let descriptor = self.change.descriptor();
        let mut ctx = ChangeContext::new(
            &descriptor.id,
            &self.scope.stage_id,
            &self.scope.execution_id,
            self.dependencies,
            self.lock,
            None,
        );
        settle(
            AssertUnwindSafe(self.change.rollback(&mut ctx))
                .catch_unwind()
                .await,
        )
    }

    fn execution_error(
        &self,
        phase: ExecutionPhase,
        duration_millis: u64,
        failure: Failure,
    ) -> ChangeExecutionError {
        ChangeExecutionError {
            stage_id: self.scope.stage_id.clone(),
            change_id: self.change.descriptor().id.clone(),
            tx_type: self.strategy.tx_type(),
            duration_millis,
            target_system_id: self.target.id().to_string(),
            phase,
            message: failure.message,
            trace: failure.trace,
        }
    }
}
