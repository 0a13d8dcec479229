//! Runs a pipeline of changes under the distributed lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use runway_storage::{AuditEntry, AuditLedger, LockService};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::{self, ChangeAction};
use crate::audit::{AuditWriter, ExecutionScope};
use crate::change::{Change, Dependencies};
use crate::config::EngineConfig;
use crate::error::{
    BlockedChange, EngineError, LockError, LockFailureKind, ManualInterventionRequired,
};
use crate::lock::{LeaseLock, LockHealth};
use crate::navigator::{ChangeOutcome, StepNavigator};
use crate::runner::{hostname, new_execution_id, RunnerId};
use crate::strategy::Strategy;
use crate::summary::RunSummary;
use crate::target::{TargetSystem, TargetSystemRegistry, DEFAULT_TARGET_SYSTEM_ID};

/// An ordered group of changes sharing a stage id.
#[derive(Clone)]
pub struct Stage {
    id: String,
    changes: Vec<Arc<dyn Change>>,
}

impl Stage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            changes: Vec::new(),
        }
    }

    pub fn with_change(mut self, change: impl Change + 'static) -> Self {
        self.changes.push(Arc::new(change));
        self
    }

    pub fn push(&mut self, change: Arc<dyn Change>) {
        self.changes.push(change);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn changes(&self) -> &[Arc<dyn Change>] {
        &self.changes
    }
}

/// Stages in execution order.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn change_count(&self) -> usize {
        self.stages.iter().map(|s| s.changes.len()).sum()
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for change in self.stages.iter().flat_map(|s| s.changes.iter()) {
            let id = &change.descriptor().id;
            if !seen.insert(id.as_str()) {
                return Err(EngineError::DuplicateChange {
                    change_id: id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Actions resolved from one read of the snapshot, parallel to the pipeline.
struct Plan {
    actions: Vec<Vec<ChangeAction>>,
    blocked: Vec<BlockedChange>,
}

impl Plan {
    fn pending(&self) -> usize {
        self.actions
            .iter()
            .flatten()
            .filter(|a| **a != ChangeAction::Skip)
            .count()
    }
}

pub struct ExecutionPlanner {
    config: EngineConfig,
    ledger: Arc<dyn AuditLedger>,
    locks: Arc<dyn LockService>,
    targets: TargetSystemRegistry,
    dependencies: Dependencies,
    interrupt: Option<watch::Receiver<bool>>,
}

impl ExecutionPlanner {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn AuditLedger>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        let targets = TargetSystemRegistry::new(config.target_systems.strict);
        Self {
            config,
            ledger,
            locks,
            targets,
            dependencies: Dependencies::new(),
            interrupt: None,
        }
    }

    pub fn with_target_system(mut self, system: Arc<dyn TargetSystem>) -> Self {
        self.targets.register(system);
        self
    }

    pub fn with_default_target_system(mut self, system: Arc<dyn TargetSystem>) -> Self {
        self.targets.set_default(system);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Stop the run, while waiting for the lock or between changes, once
    /// `interrupt` turns true.
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn target_systems(&self) -> &TargetSystemRegistry {
        &self.targets
    }

    /// Apply every pending change of `pipeline`, in order, under the lock.
    ///
    /// Stops at the first failed change. Returns an error for lock
    /// failures, changes requiring manual intervention, unknown target
    /// systems and ledger read failures.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunSummary, EngineError> {
        self.config.validate()?;
        pipeline.validate()?;

        let runner = RunnerId::generate(self.config.service_identifier.as_deref());
        let mut summary = RunSummary::new(
            runner.as_str(),
            pipeline
                .stages()
                .iter()
                .map(|s| (s.id.clone(), s.changes.len()))
                .collect(),
        );

        let preliminary = self.plan(pipeline).await?;
        if preliminary.pending() == 0 {
            info!(runner = %runner, "every change is already applied; lock not needed");
            self.record_all_skipped(pipeline, &mut summary);
            return Ok(summary);
        }

        let mut lock = LeaseLock::new(self.locks.clone(), runner.clone(), &self.config.lock);
        if let Some(interrupt) = &self.interrupt {
            lock = lock.with_interrupt(interrupt.clone());
        }
        let mut guard = match lock.acquire().await {
            Ok(guard) => guard,
            Err(err) if !self.config.lock.throw_on_failure => {
                warn!(error = %err, "lock unavailable; run skipped");
                return Ok(summary.lock_unavailable(err));
            }
            Err(err) => return Err(err.into()),
        };
        if self.config.lock.enable_refresh {
            guard.start_refresh();
        }

        let result = self
            .execute(pipeline, &runner, &guard.health(), preliminary.pending(), &mut summary)
            .await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "lock release failed; the lease will expire on its own");
        }
        result.map(|()| summary)
    }

    async fn execute(
        &self,
        pipeline: &Pipeline,
        runner: &RunnerId,
        health: &LockHealth,
        pending_before_lock: usize,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let plan = self.plan(pipeline).await?;
        if plan.pending() < pending_before_lock {
            info!(
                before = pending_before_lock,
                after = plan.pending(),
                "another runner applied changes while this one waited for the lock"
            );
        }
        if !plan.blocked.is_empty() {
            return Err(ManualInterventionRequired {
                blocked: plan.blocked,
            }
            .into());
        }
        if plan.pending() == 0 {
            self.record_all_skipped(pipeline, summary);
            return Ok(());
        }

        let targets = self.resolve_targets(pipeline, &plan)?;
        summary.interrupted_changes = self.collect_in_flight_markers().await;

        let execution_id = new_execution_id();
        summary.execution_id = Some(execution_id.clone());
        let writer = AuditWriter::new(self.ledger.clone());
        let host = hostname();
        info!(execution_id = %execution_id, runner = %runner, pending = plan.pending(), "run started");

        for (stage_index, stage) in pipeline.stages().iter().enumerate() {
            let scope = ExecutionScope {
                execution_id: execution_id.clone(),
                stage_id: stage.id.clone(),
                hostname: host.clone(),
            };
            debug!(stage_id = %stage.id, changes = stage.changes.len(), "stage started");

            for (change_index, change) in stage.changes.iter().enumerate() {
                health.ensure_held()?;
                self.check_interrupt(runner)?;

                let descriptor = change.descriptor();
                let outcome = match (
                    plan.actions[stage_index][change_index],
                    &targets[stage_index][change_index],
                ) {
                    (ChangeAction::Apply, Some(target)) => {
                        let strategy = Strategy::select(descriptor, target.as_ref());
                        debug!(change_id = %descriptor.id, %strategy, "strategy selected");
                        StepNavigator {
                            change: change.as_ref(),
                            target: target.as_ref(),
                            strategy,
                            scope: &scope,
                            dependencies: &self.dependencies,
                            lock: health,
                            writer: &writer,
                        }
                        .run(false)
                        .await
                    }
                    _ => ChangeOutcome::skipped(
                        &descriptor.id,
                        &stage.id,
                        declared_target(descriptor.target_system_id.as_deref()),
                    ),
                };

                let failed = outcome.is_failed();
                summary.record(outcome);
                if failed {
                    warn!(change_id = %descriptor.id, "stopping run after failed change");
                    return Ok(());
                }
            }
        }
        info!(
            execution_id = %execution_id,
            applied = summary.applied_count(),
            already_applied = summary.already_applied_count(),
            "run completed"
        );
        Ok(())
    }

    async fn plan(&self, pipeline: &Pipeline) -> Result<Plan, EngineError> {
        let latest: HashMap<String, AuditEntry> = self
            .ledger
            .snapshot()
            .await?
            .into_iter()
            .map(|e| (e.change_id.clone(), e))
            .collect();

        let mut blocked = Vec::new();
        let actions = pipeline
            .stages()
            .iter()
            .map(|stage| {
                stage
                    .changes
                    .iter()
                    .map(|change| {
                        let id = &change.descriptor().id;
                        let entry = latest.get(id);
                        let action = action::resolve(entry);
                        if let (ChangeAction::ManualIntervention, Some(entry)) = (action, entry) {
                            blocked.push(BlockedChange {
                                change_id: id.clone(),
                                stage_id: stage.id.clone(),
                                state: entry.state,
                            });
                        }
                        action
                    })
                    .collect()
            })
            .collect();
        Ok(Plan { actions, blocked })
    }

    /// Resolve target systems up front so an unknown one fails the run
    /// before anything executes.
    #[allow(clippy::type_complexity)]
    fn resolve_targets(
        &self,
        pipeline: &Pipeline,
        plan: &Plan,
    ) -> Result<Vec<Vec<Option<Arc<dyn TargetSystem>>>>, EngineError> {
        pipeline
            .stages()
            .iter()
            .zip(&plan.actions)
            .map(|(stage, actions)| {
                stage
                    .changes
                    .iter()
                    .zip(actions)
                    .map(|(change, action)| {
                        if *action != ChangeAction::Apply {
                            return Ok(None);
                        }
                        let descriptor = change.descriptor();
                        self.targets
                            .resolve(&descriptor.id, descriptor.target_system_id.as_deref())
                            .map(Some)
                            .map_err(EngineError::from)
                    })
                    .collect()
            })
            .collect()
    }

    async fn collect_in_flight_markers(&self) -> Vec<String> {
        let mut interrupted = Vec::new();
        for system in self.targets.systems() {
            let Some(repo) = system.ongoing_task_status() else {
                continue;
            };
            match repo.in_flight().await {
                Ok(ids) => {
                    for id in &ids {
                        warn!(
                            change_id = %id,
                            target_system = system.id(),
                            "change was left in flight by a previous runner"
                        );
                    }
                    interrupted.extend(ids);
                }
                Err(e) => warn!(target_system = system.id(), error = %e, "could not read in-flight markers"),
            }
        }
        interrupted
    }

    fn record_all_skipped(&self, pipeline: &Pipeline, summary: &mut RunSummary) {
        for stage in pipeline.stages() {
            for change in &stage.changes {
                let descriptor = change.descriptor();
                summary.record(ChangeOutcome::skipped(
                    &descriptor.id,
                    &stage.id,
                    declared_target(descriptor.target_system_id.as_deref()),
                ));
            }
        }
    }

    fn check_interrupt(&self, runner: &RunnerId) -> Result<(), LockError> {
        match &self.interrupt {
            Some(rx) if *rx.borrow() => Err(LockError::new(
                LockFailureKind::ProcessInterrupted,
                &self.config.lock.key,
                runner.as_str(),
            )
            .with_cause("interrupted between changes")),
            _ => Ok(()),
        }
    }
}

fn declared_target(target_system_id: Option<&str>) -> &str {
    target_system_id.unwrap_or(DEFAULT_TARGET_SYSTEM_ID)
}
