//! Target systems: the external stores changes act upon.

mod memory;
mod registry;

pub use memory::{InMemoryOngoingTasks, InMemoryTargetSystem, InMemoryTransaction};
pub use registry::TargetSystemRegistry;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use runway_storage::AuditEntry;
use tracing::{debug, warn};

use crate::error::{RollbackStatus, TargetSystemError, TransactionState};

/// Id of the target system used when a change names none.
pub const DEFAULT_TARGET_SYSTEM_ID: &str = "default";

/// An open transaction on a target system.
#[async_trait]
pub trait TargetTransaction: Send + 'static {
    async fn commit(self: Box<Self>) -> Result<(), TargetSystemError>;

    async fn abort(self: Box<Self>) -> Result<(), TargetSystemError>;

    /// Stage an audit entry so it becomes durable with this transaction's
    /// commit. Only target systems that share their store with the audit
    /// ledger support this.
    async fn stage_audit(&mut self, entry: &AuditEntry) -> Result<(), TargetSystemError> {
        Err(TargetSystemError::new(
            &entry.target_system_id,
            "stage audit entry",
            "target system does not share a store with the audit ledger",
        )
        .with_state(TransactionState::Active))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Tracks changes that have started but not yet been audited to completion.
#[async_trait]
pub trait OngoingTaskStatusRepository: Send + Sync {
    async fn mark_in_flight(&self, change_id: &str) -> Result<(), TargetSystemError>;

    async fn clear(&self, change_id: &str) -> Result<(), TargetSystemError>;

    async fn in_flight(&self) -> Result<Vec<String>, TargetSystemError>;
}

#[async_trait]
pub trait TargetSystem: Send + Sync {
    fn id(&self) -> &str;

    fn is_transactional(&self) -> bool {
        false
    }

    /// Whether audit entries can be committed atomically with this system's
    /// own writes.
    fn in_sync_with_audit_store(&self) -> bool {
        false
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TargetTransaction>, TargetSystemError> {
        Err(
            TargetSystemError::new(self.id(), "begin transaction", "not transactional")
                .with_state(TransactionState::NotStarted),
        )
    }

    fn ongoing_task_status(&self) -> Option<Arc<dyn OngoingTaskStatusRepository>> {
        None
    }
}

/// Target system that does nothing; the default for changes naming none.
#[derive(Debug, Clone)]
pub struct NoOpTargetSystem {
    id: String,
}

impl NoOpTargetSystem {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for NoOpTargetSystem {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_SYSTEM_ID)
    }
}

#[async_trait]
impl TargetSystem for NoOpTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Why [`wrap_in_transaction`] did not commit.
#[derive(Debug)]
pub enum TransactionFailure<E> {
    /// The operation itself failed.
    Operation {
        error: E,
        rollback: RollbackStatus,
        abort_error: Option<TargetSystemError>,
    },
    /// Begin or commit failed.
    Infrastructure(TargetSystemError),
}

impl<E> TransactionFailure<E> {
    pub fn rollback_status(&self) -> RollbackStatus {
        match self {
            TransactionFailure::Operation { rollback, .. } => *rollback,
            TransactionFailure::Infrastructure(e) => e.rollback_status,
        }
    }
}

/// Run `operation` inside a transaction on `target`: commit on success,
/// abort on failure.
///
/// The operation takes ownership of the transaction and must hand it back
/// alongside its result.
pub async fn wrap_in_transaction<T, E, F, Fut>(
    target: &dyn TargetSystem,
    operation: F,
) -> Result<T, TransactionFailure<E>>
where
    F: FnOnce(Box<dyn TargetTransaction>) -> Fut,
    Fut: Future<Output = (Box<dyn TargetTransaction>, Result<T, E>)>,
{
    let tx = target
        .begin_transaction()
        .await
        .map_err(TransactionFailure::Infrastructure)?;
    debug!(target_system = target.id(), "transaction started");

    let (tx, result) = operation(tx).await;
    match result {
        Ok(value) => {
            tx.commit().await.map_err(|e| {
                warn!(target_system = target.id(), error = %e, "commit failed");
                TransactionFailure::Infrastructure(e)
            })?;
            debug!(target_system = target.id(), "transaction committed");
            Ok(value)
        }
        Err(error) => match tx.abort().await {
            Ok(()) => {
                debug!(target_system = target.id(), "transaction aborted");
                Err(TransactionFailure::Operation {
                    error,
                    rollback: RollbackStatus::Succeeded,
                    abort_error: None,
                })
            }
            Err(abort_error) => {
                warn!(target_system = target.id(), error = %abort_error, "abort failed");
                Err(TransactionFailure::Operation {
                    error,
                    rollback: RollbackStatus::Failed,
                    abort_error: Some(abort_error),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_target_cannot_open_transactions() {
        let target = NoOpTargetSystem::default();
        assert_eq!(target.id(), DEFAULT_TARGET_SYSTEM_ID);
        assert!(!target.is_transactional());
        let err = target.begin_transaction().await.err().unwrap();
        assert_eq!(err.transaction_state, TransactionState::NotStarted);
    }

    #[tokio::test]
    async fn wrap_commits_on_success() {
        let target = InMemoryTargetSystem::transactional("db");
        let out = wrap_in_transaction(&target, |mut tx| async move {
            if let Some(t) = tx.as_any_mut().downcast_mut::<InMemoryTransaction>() {
                t.put("k", serde_json::json!(1));
            }
            (tx, Ok::<_, String>(7))
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(target.get("k").await, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn wrap_aborts_on_failure() {
        let target = InMemoryTargetSystem::transactional("db");
        let err = wrap_in_transaction(&target, |mut tx| async move {
            if let Some(t) = tx.as_any_mut().downcast_mut::<InMemoryTransaction>() {
                t.put("k", serde_json::json!(1));
            }
            (tx, Err::<(), _>("boom".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.rollback_status(), RollbackStatus::Succeeded);
        assert!(matches!(err, TransactionFailure::Operation { ref error, .. } if error == "boom"));
        assert_eq!(target.get("k").await, None);
    }

    #[tokio::test]
    async fn wrap_reports_commit_failure_as_infrastructure() {
        let target = InMemoryTargetSystem::transactional("db");
        target.fail_next_commit();
        let err = wrap_in_transaction(&target, |tx| async move { (tx, Ok::<_, String>(())) })
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionFailure::Infrastructure(_)));
    }
}
