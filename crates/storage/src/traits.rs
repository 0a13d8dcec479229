use async_trait::async_trait;

use crate::error::{LockServiceError, StorageError};
use crate::record::{AuditEntry, AuditEntryIssue, LockAcquisition};
use crate::views;

/// The append-only audit ledger backing the change engine.
///
/// ## Ordering
///
/// `history()` must return entries in insertion order. Entries for the same
/// change id must never be reordered, because the snapshot of a change is its
/// latest entry (greatest `created_at`, ties broken by insertion order).
///
/// ## Immutability
///
/// There is no update or delete. Resolving an issue appends a new terminal
/// entry; the original entries stay in the history.
///
/// ## Derived views
///
/// `snapshot`, `issues` and `issue_by_change_id` have default implementations
/// over `history()`. Backends with a native "latest row per key" query should
/// override them, keeping the semantics of [`crate::views`].
#[async_trait]
pub trait AuditLedger: Send + Sync + 'static {
    /// Durably append one entry. A failure is always reported.
    async fn append(&self, entry: &AuditEntry) -> Result<(), StorageError>;

    /// Every entry, in insertion order.
    async fn history(&self) -> Result<Vec<AuditEntry>, StorageError>;

    /// The latest entry per change id.
    async fn snapshot(&self) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(views::snapshot(&self.history().await?))
    }

    /// Snapshot entries in `STARTED`, `FAILED` or `ROLLBACK_FAILED`.
    async fn issues(&self) -> Result<Vec<AuditEntryIssue>, StorageError> {
        Ok(views::issues(&self.history().await?))
    }

    async fn issue_by_change_id(
        &self,
        change_id: &str,
    ) -> Result<Option<AuditEntryIssue>, StorageError> {
        Ok(views::issue_for(&self.history().await?, change_id))
    }
}

/// A single-key lease lock store.
///
/// ## Atomicity
///
/// `upsert` must be one backend-native check-and-set (row lock, conditional
/// update, conditional put): insert if absent, overwrite if the stored owner
/// equals `owner` or the stored `expires_at` has passed, fail otherwise. Two
/// concurrent upserts by different owners must never both succeed.
///
/// ## Expiry
///
/// Expiry is a wall-clock comparison made at the moment of the attempt.
/// There is no sweeper: a crashed holder's key becomes acquirable once its
/// lease has passed.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Acquire or re-acquire `key` for `lease_millis`.
    ///
    /// Returns `Err(LockServiceError::AlreadyOwned)` when another owner holds
    /// an unexpired lease.
    async fn upsert(
        &self,
        key: &str,
        owner: &str,
        lease_millis: u64,
    ) -> Result<LockAcquisition, LockServiceError>;

    /// Extend the lease of a key already held by `owner`.
    ///
    /// Returns `Err(LockServiceError::NotOwner)` when the stored owner differs
    /// or the key is absent.
    async fn extend(
        &self,
        key: &str,
        owner: &str,
        lease_millis: u64,
    ) -> Result<LockAcquisition, LockServiceError>;

    /// Delete the key if it is held by `owner`. A mismatch is not an error.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockServiceError>;

    async fn get(&self, key: &str) -> Result<Option<LockAcquisition>, LockServiceError>;
}
