//! Runs the storage conformance suite against the reference backends.

use std::sync::atomic::{AtomicUsize, Ordering};

use runway_storage::conformance::{run_ledger_conformance, run_lock_conformance};
use runway_storage::{InMemoryAuditLedger, InMemoryLockService, JsonLinesLedger};

#[tokio::test]
async fn in_memory_ledger_conformance() {
    let report = run_ledger_conformance(|| async { InMemoryAuditLedger::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.total > 0);
}

#[tokio::test]
async fn json_lines_ledger_conformance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let counter = AtomicUsize::new(0);
    let report = run_ledger_conformance(|| {
        let path = dir
            .path()
            .join(format!("ledger-{}.jsonl", counter.fetch_add(1, Ordering::SeqCst)));
        async move { JsonLinesLedger::new(path) }
    })
    .await;
    assert!(report.failed == 0, "{report}");
}

#[tokio::test]
async fn in_memory_lock_conformance() {
    let report = run_lock_conformance(|| async { InMemoryLockService::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.results.iter().any(|r| r.category == "concurrent"));
}
