use std::sync::Arc;

use runway_storage::{AuditEntry, AuditLedger, AuditState, ExecutionType, TxType};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::change::ChangeDescriptor;

/// Identity shared by every entry written while running one stage.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub execution_id: String,
    pub stage_id: String,
    pub hostname: String,
}

/// An audit append that did not make it to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFailure {
    pub change_id: String,
    pub state: AuditState,
    pub message: String,
}

/// Builds audit entries for one change under a fixed strategy and target.
pub(crate) struct EntryFactory<'a> {
    pub scope: &'a ExecutionScope,
    pub change: &'a ChangeDescriptor,
    pub tx_type: TxType,
    pub target_system_id: &'a str,
}

impl EntryFactory<'_> {
    pub fn entry(
        &self,
        state: AuditState,
        duration_millis: u64,
        error_trace: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            execution_id: self.scope.execution_id.clone(),
            stage_id: self.scope.stage_id.clone(),
            change_id: self.change.id.clone(),
            author: self.change.author.clone(),
            created_at: OffsetDateTime::now_utc(),
            state,
            execution_type: if self.change.system_change {
                ExecutionType::System
            } else {
                ExecutionType::Execution
            },
            class_name: self.change.class_name.clone(),
            method_name: self.change.method_name.clone(),
            duration_millis,
            execution_hostname: self.scope.hostname.clone(),
            metadata: self.change.metadata.clone(),
            system_change: self.change.system_change,
            legacy: self.change.legacy,
            error_trace,
            tx_type: self.tx_type,
            target_system_id: self.target_system_id.to_string(),
            order: self.change.order.clone(),
            recovery_strategy: self.change.recovery_strategy,
            transaction_flag: self.change.transactional,
        }
    }
}

/// Appends entries to the ledger, turning failures into [`AuditFailure`]s.
#[derive(Clone)]
pub(crate) struct AuditWriter {
    ledger: Arc<dyn AuditLedger>,
}

impl AuditWriter {
    pub fn new(ledger: Arc<dyn AuditLedger>) -> Self {
        Self { ledger }
    }

    pub async fn write(&self, entry: &AuditEntry) -> Result<(), AuditFailure> {
        match self.ledger.append(entry).await {
            Ok(()) => {
                debug!(change_id = %entry.change_id, state = %entry.state, "audit entry written");
                Ok(())
            }
            Err(e) => {
                warn!(
                    change_id = %entry.change_id,
                    state = %entry.state,
                    error = %e,
                    "audit entry could not be written"
                );
                Err(AuditFailure {
                    change_id: entry.change_id.clone(),
                    state: entry.state,
                    message: e.to_string(),
                })
            }
        }
    }
}
