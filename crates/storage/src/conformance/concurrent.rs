use std::future::Future;
use std::sync::Arc;

use super::{at_second, make_entry, TestResult};
use crate::record::AuditState;
use crate::{AuditLedger, LockService, LockServiceError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_lock_tests<K, F, Fut>(factory: &F) -> Vec<TestResult>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    vec![TestResult::from_result(
        "concurrent",
        "concurrent_upserts_exactly_one_wins",
        concurrent_upserts_exactly_one_wins(factory).await,
    )]
}

pub(super) async fn run_concurrent_ledger_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    vec![TestResult::from_result(
        "concurrent",
        "concurrent_appends_are_all_recorded",
        concurrent_appends_are_all_recorded(factory).await,
    )]
}

// ── Concurrent acquisition: exactly one wins ────────────────────────────────

/// N tasks with distinct owners race to upsert the same free key. Exactly
/// one must succeed; the rest must see AlreadyOwned.
async fn concurrent_upserts_exactly_one_wins<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let l = locks.clone();
        handles.push(tokio::spawn(async move {
            match l.upsert("race", &format!("runner-{i}"), 60_000).await {
                Ok(_) => Ok(true),
                Err(LockServiceError::AlreadyOwned { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: LockServiceError| format!("lock error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    Ok(())
}

// ── Concurrent appends: nothing is lost ─────────────────────────────────────

/// N tasks append one entry each for their own change. All N entries must be
/// in the history and the snapshot must have one entry per change.
async fn concurrent_appends_are_all_recorded<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let l = ledger.clone();
        handles.push(tokio::spawn(async move {
            let entry = make_entry(&format!("change-{i}"), AuditState::Started, at_second(i as i64));
            l.append(&entry).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("append: {e}"))?;
    }

    let history = ledger.history().await.map_err(|e| format!("history: {e}"))?;
    if history.len() != N {
        return Err(format!("expected {N} entries, got {}", history.len()));
    }
    let snapshot = ledger.snapshot().await.map_err(|e| format!("snapshot: {e}"))?;
    if snapshot.len() != N {
        return Err(format!("expected {N} snapshot entries, got {}", snapshot.len()));
    }
    Ok(())
}
