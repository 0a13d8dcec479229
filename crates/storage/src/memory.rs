use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{LockServiceError, StorageError};
use crate::record::{AuditEntry, AuditState, LockAcquisition, LockEntry};
use crate::traits::{AuditLedger, LockService};

/// In-memory audit ledger.
///
/// Clones share the same entries, so a test can hand one handle to the
/// engine and inspect another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<AuditEntry>,
    rejected_states: Vec<AuditState>,
}

impl InMemoryAuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append of an entry in `state` fail with a backend error.
    pub async fn reject_appends_in_state(&self, state: AuditState) {
        self.inner.lock().await.rejected_states.push(state);
    }

    pub async fn accept_all_appends(&self) {
        self.inner.lock().await.rejected_states.clear();
    }

    /// Append several entries under one guard: either all are recorded or none.
    pub async fn append_batch(&self, batch: &[AuditEntry]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(rejected) = batch
            .iter()
            .find(|e| inner.rejected_states.contains(&e.state))
        {
            return Err(StorageError::Backend(format!(
                "batch append rejected: {} entry for change '{}'",
                rejected.state, rejected.change_id
            )));
        }
        inner.entries.extend(batch.iter().cloned());
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

#[async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.rejected_states.contains(&entry.state) {
            return Err(StorageError::Backend(format!(
                "append of {} entry for change '{}' rejected",
                entry.state, entry.change_id
            )));
        }
        inner.entries.push(entry.clone());
        Ok(())
    }

    async fn history(&self) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self.inner.lock().await.entries.clone())
    }
}

/// In-memory lease lock store.
///
/// The check-and-set for each operation runs under one mutex guard, which
/// is the in-process equivalent of a conditional write.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockService {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry as-is, bypassing ownership checks. Used to simulate a
    /// lock left behind by another (possibly crashed) runner.
    pub async fn insert_raw(&self, entry: LockEntry) {
        self.entries.lock().await.insert(entry.key.clone(), entry);
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn upsert(
        &self,
        key: &str,
        owner: &str,
        lease_millis: u64,
    ) -> Result<LockAcquisition, LockServiceError> {
        let mut entries = self.entries.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = entries.get(key) {
            if existing.owner != owner && !existing.is_expired_at(now) {
                return Err(LockServiceError::AlreadyOwned {
                    key: key.to_string(),
                    current_owner: existing.owner.clone(),
                    expires_at: existing.expires_at,
                });
            }
        }

        let entry = LockEntry::held(key, owner, lease_millis, now);
        let acquisition = LockAcquisition::from_entry(&entry, lease_millis);
        entries.insert(key.to_string(), entry);
        Ok(acquisition)
    }

    async fn extend(
        &self,
        key: &str,
        owner: &str,
        lease_millis: u64,
    ) -> Result<LockAcquisition, LockServiceError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(existing) if existing.owner == owner => {
                let refreshed = LockEntry::held(key, owner, lease_millis, OffsetDateTime::now_utc());
                *existing = refreshed;
                Ok(LockAcquisition::from_entry(existing, lease_millis))
            }
            other => Err(LockServiceError::NotOwner {
                key: key.to_string(),
                requesting_owner: owner.to_string(),
                current_owner: other.map(|e| e.owner.clone()),
            }),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockServiceError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.owner == owner) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<LockAcquisition>, LockServiceError> {
        let entries = self.entries.lock().await;
        let now = OffsetDateTime::now_utc();
        Ok(entries.get(key).map(|e| {
            let remaining = (e.expires_at - now).whole_milliseconds().max(0);
            LockAcquisition::from_entry(e, u64::try_from(remaining).unwrap_or(0))
        }))
    }
}
