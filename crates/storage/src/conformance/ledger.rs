use std::future::Future;

use super::{at_second, make_entry, states, TestResult};
use crate::record::{AuditState, ExecutionType, RecoveryStrategy, TxType};
use crate::AuditLedger;

pub(super) async fn run_ledger_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "ledger",
        "empty_ledger_has_no_history",
        empty_ledger_has_no_history(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "history_preserves_insertion_order",
        history_preserves_insertion_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "snapshot_returns_latest_entry_per_change",
        snapshot_returns_latest_entry_per_change(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "snapshot_ties_resolve_to_last_inserted",
        snapshot_ties_resolve_to_last_inserted(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "rolled_back_change_is_not_an_issue",
        rolled_back_change_is_not_an_issue(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "open_states_are_issues",
        open_states_are_issues(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "manual_mark_closes_issue_without_erasing_history",
        manual_mark_closes_issue_without_erasing_history(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "issue_by_change_id_absent_for_unknown_change",
        issue_by_change_id_absent_for_unknown_change(factory).await,
    ));
    results.push(TestResult::from_result(
        "ledger",
        "entry_fields_persist_losslessly",
        entry_fields_persist_losslessly(factory).await,
    ));

    results
}

// ── 1. A fresh ledger is empty ──────────────────────────────────────────────

async fn empty_ledger_has_no_history<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    let history = ledger.history().await.map_err(|e| format!("history: {e}"))?;
    if !history.is_empty() {
        return Err(format!("expected empty history, got {} entries", history.len()));
    }
    let snapshot = ledger.snapshot().await.map_err(|e| format!("snapshot: {e}"))?;
    if !snapshot.is_empty() {
        return Err(format!("expected empty snapshot, got {} entries", snapshot.len()));
    }
    let issues = ledger.issues().await.map_err(|e| format!("issues: {e}"))?;
    if !issues.is_empty() {
        return Err(format!("expected no issues, got {}", issues.len()));
    }
    Ok(())
}

// ── 2. History comes back in insertion order ────────────────────────────────

async fn history_preserves_insertion_order<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    let written = vec![
        make_entry("c1", AuditState::Started, at_second(0)),
        make_entry("c1", AuditState::Applied, at_second(1)),
        make_entry("c2", AuditState::Started, at_second(2)),
        make_entry("c2", AuditState::Applied, at_second(3)),
    ];
    for entry in &written {
        ledger
            .append(entry)
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let history = ledger.history().await.map_err(|e| format!("history: {e}"))?;
    let got: Vec<(String, AuditState)> = history
        .iter()
        .map(|e| (e.change_id.clone(), e.state))
        .collect();
    let expected: Vec<(String, AuditState)> = written
        .iter()
        .map(|e| (e.change_id.clone(), e.state))
        .collect();
    if got != expected {
        return Err(format!("expected {:?}, got {:?}", expected, got));
    }
    Ok(())
}

// ── 3. Snapshot keeps only the latest entry of each change ──────────────────

async fn snapshot_returns_latest_entry_per_change<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    for entry in [
        make_entry("c1", AuditState::Started, at_second(0)),
        make_entry("c1", AuditState::Applied, at_second(1)),
        make_entry("c2", AuditState::Started, at_second(2)),
    ] {
        ledger
            .append(&entry)
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let snapshot = ledger.snapshot().await.map_err(|e| format!("snapshot: {e}"))?;
    if snapshot.len() != 2 {
        return Err(format!("expected 2 snapshot entries, got {}", snapshot.len()));
    }
    let c1 = snapshot
        .iter()
        .find(|e| e.change_id == "c1")
        .ok_or("c1 missing from snapshot")?;
    if c1.state != AuditState::Applied {
        return Err(format!("expected c1 APPLIED, got {}", c1.state));
    }
    let c2 = snapshot
        .iter()
        .find(|e| e.change_id == "c2")
        .ok_or("c2 missing from snapshot")?;
    if c2.state != AuditState::Started {
        return Err(format!("expected c2 STARTED, got {}", c2.state));
    }
    Ok(())
}

// ── 4. Entries sharing a timestamp resolve by insertion order ───────────────

async fn snapshot_ties_resolve_to_last_inserted<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    for state in [AuditState::Started, AuditState::Failed, AuditState::RolledBack] {
        ledger
            .append(&make_entry("c1", state, at_second(5)))
            .await
            .map_err(|e| format!("append: {e}"))?;
    }
    let snapshot = ledger.snapshot().await.map_err(|e| format!("snapshot: {e}"))?;
    match snapshot.as_slice() {
        [only] if only.state == AuditState::RolledBack => Ok(()),
        other => Err(format!(
            "expected a single ROLLED_BACK entry, got {:?}",
            states(other)
        )),
    }
}

// ── 5. STARTED, FAILED, ROLLED_BACK is closed ───────────────────────────────

async fn rolled_back_change_is_not_an_issue<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    for (i, state) in [AuditState::Started, AuditState::Failed, AuditState::RolledBack]
        .into_iter()
        .enumerate()
    {
        ledger
            .append(&make_entry("c1", state, at_second(i as i64)))
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let issues = ledger.issues().await.map_err(|e| format!("issues: {e}"))?;
    if !issues.is_empty() {
        return Err(format!("expected no issues, got {}", issues.len()));
    }
    let issue = ledger
        .issue_by_change_id("c1")
        .await
        .map_err(|e| format!("issue_by_change_id: {e}"))?;
    if issue.is_some() {
        return Err("expected no issue for rolled-back change".to_string());
    }
    Ok(())
}

// ── 6. STARTED, FAILED and ROLLBACK_FAILED are open issues ──────────────────

async fn open_states_are_issues<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    let entries = [
        make_entry("crashed", AuditState::Started, at_second(0)),
        make_entry("failed", AuditState::Started, at_second(1)),
        make_entry("failed", AuditState::Failed, at_second(2)),
        make_entry("rb-failed", AuditState::Started, at_second(3)),
        make_entry("rb-failed", AuditState::Failed, at_second(4)),
        make_entry("rb-failed", AuditState::RollbackFailed, at_second(5)),
        make_entry("fine", AuditState::Started, at_second(6)),
        make_entry("fine", AuditState::Applied, at_second(7)),
    ];
    for entry in &entries {
        ledger
            .append(entry)
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let issues = ledger.issues().await.map_err(|e| format!("issues: {e}"))?;
    let mut ids: Vec<&str> = issues.iter().map(|i| i.change_id()).collect();
    ids.sort_unstable();
    if ids != vec!["crashed", "failed", "rb-failed"] {
        return Err(format!("unexpected issue set: {:?}", ids));
    }

    let failed = ledger
        .issue_by_change_id("failed")
        .await
        .map_err(|e| format!("issue_by_change_id: {e}"))?
        .ok_or("expected issue for 'failed'")?;
    if failed.state() != AuditState::Failed {
        return Err(format!("expected FAILED, got {}", failed.state()));
    }
    if states(&failed.history) != vec![AuditState::Started, AuditState::Failed] {
        return Err(format!(
            "expected history [STARTED, FAILED], got {:?}",
            states(&failed.history)
        ));
    }
    Ok(())
}

// ── 7. A manual mark closes the issue and keeps the original entries ────────

async fn manual_mark_closes_issue_without_erasing_history<L, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    for entry in [
        make_entry("c1", AuditState::Started, at_second(0)),
        make_entry("c1", AuditState::Failed, at_second(1)),
        make_entry("c1", AuditState::ManualMarkedAsApplied, at_second(2)),
    ] {
        ledger
            .append(&entry)
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let issues = ledger.issues().await.map_err(|e| format!("issues: {e}"))?;
    if !issues.is_empty() {
        return Err(format!("expected no issues after manual mark, got {}", issues.len()));
    }
    let history = ledger.history().await.map_err(|e| format!("history: {e}"))?;
    if history.len() != 3 {
        return Err(format!("expected 3 history entries, got {}", history.len()));
    }
    let snapshot = ledger.snapshot().await.map_err(|e| format!("snapshot: {e}"))?;
    if !snapshot.iter().all(|e| e.state.is_applied()) {
        return Err(format!("expected applied snapshot, got {:?}", states(&snapshot)));
    }
    Ok(())
}

// ── 8. Unknown change ids have no issue ─────────────────────────────────────

async fn issue_by_change_id_absent_for_unknown_change<L, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    ledger
        .append(&make_entry("c1", AuditState::Failed, at_second(0)))
        .await
        .map_err(|e| format!("append: {e}"))?;
    let issue = ledger
        .issue_by_change_id("does-not-exist")
        .await
        .map_err(|e| format!("issue_by_change_id: {e}"))?;
    match issue {
        None => Ok(()),
        Some(i) => Err(format!("expected no issue, got one for {}", i.change_id())),
    }
}

// ── 9. Every field, nullable or not, survives a round trip ──────────────────

async fn entry_fields_persist_losslessly<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;

    let sparse = make_entry("sparse", AuditState::Started, at_second(0));
    let mut full = make_entry("full", AuditState::Failed, at_second(1));
    full.execution_type = ExecutionType::System;
    full.metadata = serde_json::json!({"ticket": "OPS-12", "rows": 42});
    full.system_change = true;
    full.legacy = true;
    full.error_trace = Some("column already exists\ncaused by: duplicate".to_string());
    full.tx_type = TxType::TxSeparateNoMarker;
    full.target_system_id = "warehouse".to_string();
    full.order = None;
    full.recovery_strategy = RecoveryStrategy::AlwaysRetry;
    full.transaction_flag = Some(false);

    for entry in [&sparse, &full] {
        ledger
            .append(entry)
            .await
            .map_err(|e| format!("append: {e}"))?;
    }

    let history = ledger.history().await.map_err(|e| format!("history: {e}"))?;
    if history.len() != 2 {
        return Err(format!("expected 2 entries, got {}", history.len()));
    }
    if history[0] != sparse {
        return Err(format!("sparse entry changed: {:?}", history[0]));
    }
    if history[1] != full {
        return Err(format!("full entry changed: {:?}", history[1]));
    }
    Ok(())
}
