//! Views derived from the raw audit history.
//!
//! Every backend shares these so that "latest entry" and "open issue" mean
//! the same thing regardless of where the entries live.

use std::collections::HashMap;

use time::OffsetDateTime;

use crate::record::{AuditEntry, AuditEntryIssue};

/// The latest entry per change id, in order of each change's first appearance.
///
/// An entry replaces the current one when its `created_at` is greater or
/// equal, so entries sharing a timestamp resolve to the one inserted last.
pub fn snapshot(history: &[AuditEntry]) -> Vec<AuditEntry> {
    let mut latest: Vec<AuditEntry> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for entry in history {
        match index.get(entry.change_id.as_str()) {
            Some(&i) => {
                if entry.created_at >= latest[i].created_at {
                    latest[i] = entry.clone();
                }
            }
            None => {
                index.insert(entry.change_id.as_str(), latest.len());
                latest.push(entry.clone());
            }
        }
    }

    latest
}

/// Snapshot entries whose state needs operator attention.
pub fn issues(history: &[AuditEntry]) -> Vec<AuditEntryIssue> {
    snapshot(history)
        .into_iter()
        .filter(|entry| entry.state.is_issue())
        .map(|entry| {
            let change_history = history_for(history, &entry.change_id);
            AuditEntryIssue {
                entry,
                history: change_history,
            }
        })
        .collect()
}

pub fn issue_for(history: &[AuditEntry], change_id: &str) -> Option<AuditEntryIssue> {
    let change_history = history_for(history, change_id);
    let latest = snapshot(&change_history).into_iter().next()?;
    if !latest.state.is_issue() {
        return None;
    }
    Some(AuditEntryIssue {
        entry: latest,
        history: change_history,
    })
}

/// Every entry of one change, in insertion order.
pub fn history_for(history: &[AuditEntry], change_id: &str) -> Vec<AuditEntry> {
    history
        .iter()
        .filter(|e| e.change_id == change_id)
        .cloned()
        .collect()
}

/// Snapshot entries created at or after `since`.
pub fn snapshot_since(history: &[AuditEntry], since: OffsetDateTime) -> Vec<AuditEntry> {
    snapshot(history)
        .into_iter()
        .filter(|e| e.created_at >= since)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuditState, ExecutionType, RecoveryStrategy, TxType};
    use time::macros::datetime;

    fn entry(change_id: &str, state: AuditState, at: OffsetDateTime) -> AuditEntry {
        AuditEntry {
            execution_id: "exec-1".to_string(),
            stage_id: "stage-1".to_string(),
            change_id: change_id.to_string(),
            author: "tester".to_string(),
            created_at: at,
            state,
            execution_type: ExecutionType::Execution,
            class_name: "Change".to_string(),
            method_name: "apply".to_string(),
            duration_millis: 0,
            execution_hostname: "host".to_string(),
            metadata: serde_json::Value::Null,
            system_change: false,
            legacy: false,
            error_trace: None,
            tx_type: TxType::NonTx,
            target_system_id: "default".to_string(),
            order: None,
            recovery_strategy: RecoveryStrategy::ManualIntervention,
            transaction_flag: None,
        }
    }

    #[test]
    fn snapshot_keeps_first_appearance_order() {
        let t = datetime!(2026-01-01 00:00:00 UTC);
        let history = vec![
            entry("b", AuditState::Started, t),
            entry("a", AuditState::Started, t),
            entry("b", AuditState::Applied, t),
        ];
        let snap = snapshot(&history);
        let ids: Vec<&str> = snap.iter().map(|e| e.change_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(snap[0].state, AuditState::Applied);
    }

    #[test]
    fn older_entry_inserted_late_does_not_win() {
        let history = vec![
            entry("a", AuditState::Applied, datetime!(2026-01-01 00:00:10 UTC)),
            entry("a", AuditState::Started, datetime!(2026-01-01 00:00:00 UTC)),
        ];
        assert_eq!(snapshot(&history)[0].state, AuditState::Applied);
    }

    #[test]
    fn rolled_back_after_failure_is_not_an_issue() {
        let t = datetime!(2026-01-01 00:00:00 UTC);
        let history = vec![
            entry("x", AuditState::Started, t),
            entry("x", AuditState::Failed, t),
            entry("x", AuditState::RolledBack, t),
            entry("y", AuditState::Started, t),
            entry("y", AuditState::Failed, t),
        ];
        let open = issues(&history);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].change_id(), "y");
        assert_eq!(open[0].history.len(), 2);
        assert!(issue_for(&history, "x").is_none());
    }

    #[test]
    fn issue_error_trace_comes_from_latest_entry_with_one() {
        let t = datetime!(2026-01-01 00:00:00 UTC);
        let mut failed = entry("x", AuditState::Failed, t);
        failed.error_trace = Some("boom".to_string());
        let history = vec![entry("x", AuditState::Started, t), failed];
        let issue = issue_for(&history, "x").expect("open issue");
        assert_eq!(issue.error_trace(), Some("boom"));
    }

    #[test]
    fn snapshot_since_filters_by_latest_timestamp() {
        let history = vec![
            entry("a", AuditState::Applied, datetime!(2026-01-01 00:00:00 UTC)),
            entry("b", AuditState::Applied, datetime!(2026-02-01 00:00:00 UTC)),
        ];
        let recent = snapshot_since(&history, datetime!(2026-01-15 00:00:00 UTC));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].change_id, "b");
    }
}
