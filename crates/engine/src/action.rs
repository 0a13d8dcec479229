use runway_storage::{AuditEntry, AuditState};

/// What the planner does with a change, given its latest audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Apply,
    Skip,
    ManualIntervention,
}

/// Resolve the action for a change from its snapshot entry.
///
/// A change left `STARTED`, `ROLLBACK_FAILED` or non-transactionally
/// `FAILED` may have partially mutated its target system, so it is only
/// retried when its recorded recovery strategy allows it. A transactional
/// `FAILED` was reverted by its transaction and is safe to apply again.
pub fn resolve(latest: Option<&AuditEntry>) -> ChangeAction {
    let Some(entry) = latest else {
        return ChangeAction::Apply;
    };
    match entry.state {
        AuditState::Applied | AuditState::ManualMarkedAsApplied => ChangeAction::Skip,
        AuditState::RolledBack | AuditState::ManualMarkedAsRolledBack => ChangeAction::Apply,
        AuditState::Failed if entry.tx_type.is_transactional() => ChangeAction::Apply,
        AuditState::Failed | AuditState::Started | AuditState::RollbackFailed => {
            if entry.recovery_strategy.is_always_retry() {
                ChangeAction::Apply
            } else {
                ChangeAction::ManualIntervention
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_storage::{RecoveryStrategy, TxType};

    fn entry(state: AuditState, tx_type: TxType, recovery: RecoveryStrategy) -> AuditEntry {
        serde_json::from_value(serde_json::json!({
            "execution_id": "e", "stage_id": "s", "change_id": "c", "author": "a",
            "created_at": "2026-01-01T00:00:00Z", "state": state,
            "class_name": "C", "method_name": "apply", "duration_millis": 0,
            "execution_hostname": "h", "target_system_id": "t",
            "tx_type": tx_type, "recovery_strategy": recovery
        }))
        .unwrap()
    }

    #[test]
    fn unseen_change_is_applied() {
        assert_eq!(resolve(None), ChangeAction::Apply);
    }

    #[test]
    fn applied_states_are_skipped() {
        for state in [AuditState::Applied, AuditState::ManualMarkedAsApplied] {
            let e = entry(state, TxType::NonTx, RecoveryStrategy::ManualIntervention);
            assert_eq!(resolve(Some(&e)), ChangeAction::Skip, "{state}");
        }
    }

    #[test]
    fn rolled_back_states_are_reapplied() {
        for state in [AuditState::RolledBack, AuditState::ManualMarkedAsRolledBack] {
            let e = entry(state, TxType::NonTx, RecoveryStrategy::ManualIntervention);
            assert_eq!(resolve(Some(&e)), ChangeAction::Apply, "{state}");
        }
    }

    #[test]
    fn transactional_failure_is_retried() {
        for tx in [TxType::TxShared, TxType::TxSeparateNoMarker] {
            let e = entry(AuditState::Failed, tx, RecoveryStrategy::ManualIntervention);
            assert_eq!(resolve(Some(&e)), ChangeAction::Apply, "{tx}");
        }
    }

    #[test]
    fn unclear_states_need_an_operator_unless_always_retry() {
        let unclear = [
            (AuditState::Failed, TxType::NonTx),
            (AuditState::Started, TxType::NonTx),
            (AuditState::Started, TxType::TxSeparateNoMarker),
            (AuditState::RollbackFailed, TxType::NonTx),
        ];
        for (state, tx) in unclear {
            let manual = entry(state, tx, RecoveryStrategy::ManualIntervention);
            assert_eq!(
                resolve(Some(&manual)),
                ChangeAction::ManualIntervention,
                "{state} {tx}"
            );
            let retry = entry(state, tx, RecoveryStrategy::AlwaysRetry);
            assert_eq!(resolve(Some(&retry)), ChangeAction::Apply, "{state} {tx}");
        }
    }
}
