//! Conformance test suite for `AuditLedger` and `LockService` implementations.
//!
//! Backend-agnostic checks that any adapter can run to verify it honours the
//! contracts the engine depends on:
//!
//! - **Ledger**: insertion-ordered history, latest-entry snapshot, issue
//!   detection, lossless persistence of nullable fields
//! - **Lock**: acquire, idempotent re-acquire, contention, expiry reclaim,
//!   owner-only extension and release
//! - **Concurrency**: racing acquisitions produce exactly one winner; racing
//!   appends lose nothing
//!
//! # Usage
//!
//! Backend crates call [`run_ledger_conformance`] / [`run_lock_conformance`]
//! with a factory that creates a fresh, empty backend for each test:
//!
//! ```ignore
//! use runway_storage::conformance::run_ledger_conformance;
//!
//! #[tokio::test]
//! async fn postgres_ledger_conformance() {
//!     let report = run_ledger_conformance(|| async {
//!         create_test_postgres_ledger().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod ledger;
mod lock;

use std::fmt;
use std::future::Future;

use time::OffsetDateTime;

use crate::record::{AuditEntry, AuditState, ExecutionType, RecoveryStrategy, TxType};
use crate::{AuditLedger, LockService};

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "ledger", "lock", "concurrent").
    pub category: String,
    /// Test name (e.g. "snapshot_returns_latest_entry_per_change").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ConformanceReport {
    fn from_results(results: Vec<TestResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let total = results.len();
        Self {
            results,
            passed,
            failed: total - passed,
            total,
        }
    }
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the ledger checks against an `AuditLedger` backend.
///
/// The `factory` is called once per test to create a fresh, empty ledger.
pub async fn run_ledger_conformance<L, F, Fut>(factory: F) -> ConformanceReport
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();
    results.extend(ledger::run_ledger_tests(&factory).await);
    results.extend(concurrent::run_concurrent_ledger_tests(&factory).await);
    ConformanceReport::from_results(results)
}

/// Run the lock checks against a `LockService` backend.
///
/// The `factory` is called once per test to create a fresh lock store with
/// no keys held.
pub async fn run_lock_conformance<K, F, Fut>(factory: F) -> ConformanceReport
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let mut results = Vec::new();
    results.extend(lock::run_lock_tests(&factory).await);
    results.extend(concurrent::run_concurrent_lock_tests(&factory).await);
    ConformanceReport::from_results(results)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn make_entry(
    change_id: &str,
    state: AuditState,
    created_at: OffsetDateTime,
) -> AuditEntry {
    AuditEntry {
        execution_id: "exec-conformance".to_string(),
        stage_id: "stage-1".to_string(),
        change_id: change_id.to_string(),
        author: "conformance".to_string(),
        created_at,
        state,
        execution_type: ExecutionType::Execution,
        class_name: "conformance::Change".to_string(),
        method_name: "apply".to_string(),
        duration_millis: 12,
        execution_hostname: "conformance-host".to_string(),
        metadata: serde_json::Value::Null,
        system_change: false,
        legacy: false,
        error_trace: None,
        tx_type: TxType::NonTx,
        target_system_id: "default".to_string(),
        order: Some("001".to_string()),
        recovery_strategy: RecoveryStrategy::ManualIntervention,
        transaction_flag: None,
    }
}

fn base_time() -> OffsetDateTime {
    time::macros::datetime!(2026-01-01 00:00:00 UTC)
}

pub(crate) fn at_second(s: i64) -> OffsetDateTime {
    base_time() + time::Duration::seconds(s)
}

fn states(entries: &[AuditEntry]) -> Vec<AuditState> {
    entries.iter().map(|e| e.state).collect()
}
