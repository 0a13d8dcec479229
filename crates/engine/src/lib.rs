//! Runway change execution engine.
//!
//! An [`ExecutionPlanner`] takes the distributed lock, works out which
//! changes of a [`Pipeline`] still need to run from the audit ledger's
//! snapshot, and drives each one through the step navigator with the
//! strategy its target system allows. [`OpsClient`] covers the operator
//! side: history, snapshot, open issues and manual fixes.

mod action;
mod audit;
pub mod change;
mod config;
mod error;
pub mod lock;
mod navigator;
pub mod ops;
mod planner;
mod runner;
mod strategy;
mod summary;
pub mod target;

pub use action::{resolve as resolve_action, ChangeAction};
pub use audit::{AuditFailure, ExecutionScope};
pub use change::{Change, ChangeContext, ChangeDescriptor, ChangeError, Dependencies};
pub use config::{EngineConfig, LockConfig, TargetSystemsConfig};
pub use error::{
    BlockedChange, ChangeExecutionError, EngineError, ExecutionPhase, LockError, LockFailureKind,
    ManualInterventionRequired, RollbackStatus, TargetSystemError, TargetSystemResolutionError,
    TransactionState,
};
pub use lock::{LeaseLock, LockGuard, LockHealth};
pub use navigator::{ChangeOutcome, ChangeStatus, NavigatorState, RollbackOutcome};
pub use ops::{FixOutcome, OpsClient, Resolution};
pub use planner::{ExecutionPlanner, Pipeline, Stage};
pub use runner::{new_execution_id, RunnerId};
pub use strategy::Strategy;
pub use summary::{RunStatus, RunSummary, StageSummary};
pub use target::{
    wrap_in_transaction, InMemoryOngoingTasks, InMemoryTargetSystem, InMemoryTransaction,
    NoOpTargetSystem, OngoingTaskStatusRepository, TargetSystem, TargetSystemRegistry,
    TargetTransaction, TransactionFailure, DEFAULT_TARGET_SYSTEM_ID,
};
