use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use runway_storage::{AuditEntry, InMemoryAuditLedger};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{OngoingTaskStatusRepository, TargetSystem, TargetTransaction};
use crate::error::{RollbackStatus, TargetSystemError, TransactionState};

type Store = Arc<Mutex<BTreeMap<String, Value>>>;

/// Key-value target system kept in memory.
///
/// Three flavours:
/// - [`InMemoryTargetSystem::non_transactional`]: writes go straight to the store
/// - [`InMemoryTargetSystem::transactional`]: writes are buffered per transaction
/// - [`InMemoryTargetSystem::in_sync_with`]: transactional, and audit entries
///   staged in a transaction are appended to the given ledger on commit
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryTargetSystem {
    id: String,
    transactional: bool,
    store: Store,
    ledger: Option<InMemoryAuditLedger>,
    ongoing: Option<Arc<InMemoryOngoingTasks>>,
    fail_next_commit: Arc<AtomicBool>,
    fail_next_abort: Arc<AtomicBool>,
}

impl InMemoryTargetSystem {
    fn build(id: &str, transactional: bool, ledger: Option<InMemoryAuditLedger>) -> Self {
        Self {
            id: id.to_string(),
            transactional,
            store: Store::default(),
            ledger,
            ongoing: None,
            fail_next_commit: Arc::new(AtomicBool::new(false)),
            fail_next_abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn non_transactional(id: &str) -> Self {
        Self::build(id, false, None)
    }

    pub fn transactional(id: &str) -> Self {
        Self::build(id, true, None)
    }

    pub fn in_sync_with(id: &str, ledger: InMemoryAuditLedger) -> Self {
        Self::build(id, true, Some(ledger))
    }

    /// Track in-flight changes in an [`InMemoryOngoingTasks`] repository.
    pub fn with_ongoing_tasks(mut self) -> Self {
        self.ongoing = Some(Arc::new(InMemoryOngoingTasks::default()));
        self
    }

    pub fn ongoing_tasks(&self) -> Option<Arc<InMemoryOngoingTasks>> {
        self.ongoing.clone()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.store.lock().await.get(key).cloned()
    }

    /// Write directly, outside any transaction.
    pub async fn put(&self, key: impl Into<String>, value: Value) {
        self.store.lock().await.insert(key.into(), value);
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.store.lock().await.remove(key)
    }

    pub async fn contents(&self) -> BTreeMap<String, Value> {
        self.store.lock().await.clone()
    }

    /// Make the commit of the next transaction begun on this system fail.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the abort of the next transaction begun on this system fail.
    pub fn fail_next_abort(&self) {
        self.fail_next_abort.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TargetSystem for InMemoryTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn in_sync_with_audit_store(&self) -> bool {
        self.ledger.is_some()
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TargetTransaction>, TargetSystemError> {
        if !self.transactional {
            return Err(
                TargetSystemError::new(&self.id, "begin transaction", "not transactional")
                    .with_state(TransactionState::NotStarted),
            );
        }
        Ok(Box::new(InMemoryTransaction {
            target_system_id: self.id.clone(),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            writes: Vec::new(),
            staged_audit: Vec::new(),
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
            fail_abort: self.fail_next_abort.swap(false, Ordering::SeqCst),
        }))
    }

    fn ongoing_task_status(&self) -> Option<Arc<dyn OngoingTaskStatusRepository>> {
        self.ongoing
            .clone()
            .map(|o| o as Arc<dyn OngoingTaskStatusRepository>)
    }
}

/// Buffered writes against an [`InMemoryTargetSystem`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    target_system_id: String,
    store: Store,
    ledger: Option<InMemoryAuditLedger>,
    writes: Vec<(String, Value)>,
    staged_audit: Vec<AuditEntry>,
    fail_commit: bool,
    fail_abort: bool,
}

impl InMemoryTransaction {
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.writes.push((key.into(), value));
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

#[async_trait]
impl TargetTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), TargetSystemError> {
        let this = *self;
        if this.fail_commit {
            return Err(TargetSystemError::new(
                &this.target_system_id,
                "commit",
                "injected commit failure",
            )
            .with_state(TransactionState::Aborted)
            .with_rollback(RollbackStatus::Succeeded));
        }
        // Audit batch first: a rejected batch leaves the store untouched.
        if let Some(ledger) = &this.ledger {
            if !this.staged_audit.is_empty() {
                ledger.append_batch(&this.staged_audit).await.map_err(|e| {
                    TargetSystemError::new(&this.target_system_id, "commit", e.to_string())
                        .with_state(TransactionState::Aborted)
                        .with_rollback(RollbackStatus::Succeeded)
                })?;
            }
        }
        this.store.lock().await.extend(this.writes);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), TargetSystemError> {
        if self.fail_abort {
            return Err(TargetSystemError::new(
                &self.target_system_id,
                "abort",
                "injected abort failure",
            )
            .with_state(TransactionState::Unknown)
            .with_rollback(RollbackStatus::Failed));
        }
        Ok(())
    }

    async fn stage_audit(&mut self, entry: &AuditEntry) -> Result<(), TargetSystemError> {
        if self.ledger.is_none() {
            return Err(TargetSystemError::new(
                &self.target_system_id,
                "stage audit entry",
                "target system does not share a store with the audit ledger",
            )
            .with_state(TransactionState::Active));
        }
        self.staged_audit.push(entry.clone());
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// In-memory set of in-flight change ids.
#[derive(Debug, Default)]
pub struct InMemoryOngoingTasks {
    ids: Mutex<BTreeSet<String>>,
}

impl InMemoryOngoingTasks {
    pub async fn ids(&self) -> Vec<String> {
        self.ids.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl OngoingTaskStatusRepository for InMemoryOngoingTasks {
    async fn mark_in_flight(&self, change_id: &str) -> Result<(), TargetSystemError> {
        self.ids.lock().await.insert(change_id.to_string());
        Ok(())
    }

    async fn clear(&self, change_id: &str) -> Result<(), TargetSystemError> {
        self.ids.lock().await.remove(change_id);
        Ok(())
    }

    async fn in_flight(&self) -> Result<Vec<String>, TargetSystemError> {
        Ok(self.ids().await)
    }
}
