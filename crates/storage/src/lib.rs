//! Storage contracts for the Runway change engine.
//!
//! The engine only ever talks to two backends: an append-only
//! [`AuditLedger`] and a lease-based [`LockService`]. This crate defines
//! both traits, the records they persist, the derived ledger views
//! (snapshot and open issues), two reference backends and a conformance
//! suite that concrete adapters can run against themselves.

pub mod conformance;
mod error;
mod jsonl;
mod memory;
mod record;
mod traits;
pub mod views;

pub use error::{LockServiceError, StorageError};
pub use jsonl::JsonLinesLedger;
pub use memory::{InMemoryAuditLedger, InMemoryLockService};
pub use record::{
    lease_expiry, AuditEntry, AuditEntryIssue, AuditState, ExecutionType, LockAcquisition,
    LockEntry, LockStatus, RecoveryStrategy, TxType,
};
pub use traits::{AuditLedger, LockService};
