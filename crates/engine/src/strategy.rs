use std::fmt;

use runway_storage::TxType;

use crate::change::ChangeDescriptor;
use crate::target::TargetSystem;

/// How a change and its audit entries are sequenced against the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Change effects and audit entries are unrelated writes; a failure may
    /// call the change's rollback.
    NonTransactional,
    /// The change runs in its own transaction; audit entries are written
    /// before and after it.
    TransactionalSeparate,
    /// The change and its audit entries commit in one transaction.
    TransactionalShared,
}

impl Strategy {
    /// Pure function of the three flags.
    pub fn from_flags(
        change_transactional: bool,
        target_transactional: bool,
        target_in_sync_with_audit: bool,
    ) -> Self {
        match (change_transactional, target_transactional, target_in_sync_with_audit) {
            (true, true, true) => Strategy::TransactionalShared,
            (true, true, false) => Strategy::TransactionalSeparate,
            _ => Strategy::NonTransactional,
        }
    }

    pub fn select(change: &ChangeDescriptor, target: &dyn TargetSystem) -> Self {
        Self::from_flags(
            change.is_transactional(),
            target.is_transactional(),
            target.in_sync_with_audit_store(),
        )
    }

    pub fn tx_type(self) -> TxType {
        match self {
            Strategy::NonTransactional => TxType::NonTx,
            Strategy::TransactionalSeparate => TxType::TxSeparateNoMarker,
            Strategy::TransactionalShared => TxType::TxShared,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::NonTransactional => "non-transactional",
            Strategy::TransactionalSeparate => "transactional (separate audit)",
            Strategy::TransactionalShared => "transactional (shared audit)",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{InMemoryTargetSystem, NoOpTargetSystem};
    use runway_storage::InMemoryAuditLedger;

    #[test]
    fn every_flag_combination_maps_to_one_strategy() {
        for change_tx in [false, true] {
            for target_tx in [false, true] {
                for in_sync in [false, true] {
                    let expected = if change_tx && target_tx && in_sync {
                        Strategy::TransactionalShared
                    } else if change_tx && target_tx {
                        Strategy::TransactionalSeparate
                    } else {
                        Strategy::NonTransactional
                    };
                    assert_eq!(
                        Strategy::from_flags(change_tx, target_tx, in_sync),
                        expected,
                        "flags ({change_tx}, {target_tx}, {in_sync})"
                    );
                }
            }
        }
    }

    #[test]
    fn selection_reads_change_and_target() {
        let change = ChangeDescriptor::new("c", "a");
        let shared = InMemoryTargetSystem::in_sync_with("db", InMemoryAuditLedger::new());
        assert_eq!(
            Strategy::select(&change, &shared),
            Strategy::TransactionalShared
        );
        assert_eq!(
            Strategy::select(&change.clone().transactional(false), &shared),
            Strategy::NonTransactional
        );
        assert_eq!(
            Strategy::select(&change, &NoOpTargetSystem::default()),
            Strategy::NonTransactional
        );
        assert_eq!(
            Strategy::select(&change, &InMemoryTargetSystem::transactional("db")).tx_type(),
            TxType::TxSeparateNoMarker
        );
    }
}
