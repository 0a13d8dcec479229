//! End-to-end runs of the execution planner against the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runway_engine::{
    Change, ChangeContext, ChangeDescriptor, ChangeError, ChangeStatus, EngineConfig, EngineError,
    ExecutionPlanner, FixOutcome, InMemoryTargetSystem, InMemoryTransaction, LockFailureKind,
    OngoingTaskStatusRepository, OpsClient, Pipeline, Resolution, RollbackOutcome, RunStatus,
    Stage, TargetSystem,
};
use runway_storage::{
    AuditEntry, AuditLedger, AuditState, InMemoryAuditLedger, InMemoryLockService,
    JsonLinesLedger, LockEntry, LockService, RecoveryStrategy, TxType,
};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;

const LOCK_KEY: &str = "runway-lock";

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Succeed,
    Fail,
    /// Take the lock away from the runner, then wait long enough for the
    /// refresh task to notice.
    StealLock(InMemoryLockService),
    /// Raise the interrupt flag.
    Interrupt(Arc<watch::Sender<bool>>),
}

struct TestChange {
    descriptor: ChangeDescriptor,
    target: InMemoryTargetSystem,
    apply: Step,
    rollback: Option<Step>,
}

impl TestChange {
    fn new(id: &str, target: &InMemoryTargetSystem) -> Self {
        Self {
            descriptor: ChangeDescriptor::new(id, "tester")
                .order(id)
                .target_system(target.id()),
            target: target.clone(),
            apply: Step::Succeed,
            rollback: None,
        }
    }

    fn failing(mut self) -> Self {
        self.apply = Step::Fail;
        self
    }

    fn with_rollback(mut self, step: Step) -> Self {
        self.rollback = Some(step);
        self
    }

    fn applying(mut self, step: Step) -> Self {
        self.apply = step;
        self
    }

    fn describe(mut self, f: impl FnOnce(ChangeDescriptor) -> ChangeDescriptor) -> Self {
        self.descriptor = f(self.descriptor);
        self
    }
}

#[async_trait]
impl Change for TestChange {
    fn descriptor(&self) -> &ChangeDescriptor {
        &self.descriptor
    }

    async fn apply(&self, ctx: &mut ChangeContext<'_>) -> Result<(), ChangeError> {
        match ctx.transaction::<InMemoryTransaction>() {
            Some(tx) => tx.put(self.descriptor.id.clone(), json!("applied")),
            None => {
                self.target
                    .put(self.descriptor.id.clone(), json!("applied"))
                    .await
            }
        }
        match &self.apply {
            Step::Succeed => Ok(()),
            Step::Fail => Err(ChangeError::msg(format!("{} blew up", self.descriptor.id))),
            Step::StealLock(locks) => {
                locks
                    .insert_raw(LockEntry::held(
                        LOCK_KEY,
                        "intruder",
                        60_000,
                        OffsetDateTime::now_utc(),
                    ))
                    .await;
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            }
            Step::Interrupt(tx) => {
                let _ = tx.send(true);
                Ok(())
            }
        }
    }

    fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    async fn rollback(&self, _ctx: &mut ChangeContext<'_>) -> Result<(), ChangeError> {
        match self.rollback {
            Some(Step::Succeed) => {
                self.target.remove(&self.descriptor.id).await;
                Ok(())
            }
            _ => Err(ChangeError::msg("rollback blew up")),
        }
    }
}

struct Env {
    ledger: InMemoryAuditLedger,
    locks: InMemoryLockService,
    target: InMemoryTargetSystem,
    config: EngineConfig,
}

impl Env {
    fn new(target: InMemoryTargetSystem) -> Self {
        let mut config = EngineConfig::default();
        config.service_identifier = Some("planner-tests".into());
        config.lock.lease_millis = 5_000;
        config.lock.retry_frequency_millis = 10;
        config.lock.quit_trying_after_millis = 100;
        Self {
            ledger: InMemoryAuditLedger::new(),
            locks: InMemoryLockService::new(),
            target,
            config,
        }
    }

    fn non_transactional() -> Self {
        Self::new(InMemoryTargetSystem::non_transactional("files"))
    }

    fn planner(&self) -> ExecutionPlanner {
        ExecutionPlanner::new(
            self.config.clone(),
            Arc::new(self.ledger.clone()),
            Arc::new(self.locks.clone()),
        )
        .with_target_system(Arc::new(self.target.clone()))
    }

    fn ops(&self) -> OpsClient {
        OpsClient::new(Arc::new(self.ledger.clone()))
    }

    async fn trail(&self) -> Vec<(String, AuditState)> {
        self.ledger
            .history()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.change_id, e.state))
            .collect()
    }

    async fn lock_is_free(&self) -> bool {
        self.locks.get(LOCK_KEY).await.unwrap().is_none()
    }
}

fn single_stage(changes: Vec<TestChange>) -> Pipeline {
    let mut stage = Stage::new("main");
    for change in changes {
        stage.push(Arc::new(change));
    }
    Pipeline::new().with_stage(stage)
}

fn four_changes(env: &Env, third: impl FnOnce(TestChange) -> TestChange) -> Pipeline {
    single_stage(vec![
        TestChange::new("c1", &env.target),
        TestChange::new("c2", &env.target),
        third(TestChange::new("c3", &env.target)),
        TestChange::new("c4", &env.target),
    ])
}

fn pair(id: &str, state: AuditState) -> (String, AuditState) {
    (id.to_string(), state)
}

// ──────────────────────────────────────────────
// Happy path and re-runs
// ──────────────────────────────────────────────

#[tokio::test]
async fn applies_every_change_in_order_and_releases_the_lock() {
    let env = Env::non_transactional();
    let pipeline = four_changes(&env, |c| c);

    let summary = env.planner().run(&pipeline).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.applied_count(), 4);
    assert!(summary.execution_id.is_some());
    assert!(summary.runner_id.starts_with("planner-tests@"));
    assert_eq!(
        env.trail().await,
        vec![
            pair("c1", AuditState::Started),
            pair("c1", AuditState::Applied),
            pair("c2", AuditState::Started),
            pair("c2", AuditState::Applied),
            pair("c3", AuditState::Started),
            pair("c3", AuditState::Applied),
            pair("c4", AuditState::Started),
            pair("c4", AuditState::Applied),
        ]
    );
    assert_eq!(env.target.contents().await.len(), 4);
    assert!(env.lock_is_free().await);

    let history = env.ledger.history().await.unwrap();
    let exec = &history[0].execution_id;
    assert!(history.iter().all(|e| &e.execution_id == exec));
    assert!(history.iter().all(|e| e.stage_id == "main"));
    assert!(history.iter().all(|e| e.tx_type == TxType::NonTx));
    assert!(history.iter().all(|e| e.target_system_id == "files"));
}

#[tokio::test]
async fn rerun_skips_applied_changes_without_taking_the_lock() {
    let env = Env::non_transactional();
    let pipeline = four_changes(&env, |c| c);
    env.planner().run(&pipeline).await.unwrap();
    let entries_after_first = env.ledger.len().await;

    // A foreign holder would block any acquisition attempt.
    env.locks
        .insert_raw(LockEntry::held(
            LOCK_KEY,
            "someone-else",
            60_000,
            OffsetDateTime::now_utc(),
        ))
        .await;

    let summary = env.planner().run(&pipeline).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.applied_count(), 0);
    assert_eq!(summary.already_applied_count(), 4);
    assert_eq!(summary.execution_id, None);
    assert_eq!(env.ledger.len().await, entries_after_first);
}

#[tokio::test]
async fn concurrent_runners_apply_each_change_once() {
    let env = Env::non_transactional();
    let mut config = env.config.clone();
    config.lock.quit_trying_after_millis = 5_000;
    let pipeline = four_changes(&env, |c| c);

    let make = || {
        ExecutionPlanner::new(
            config.clone(),
            Arc::new(env.ledger.clone()),
            Arc::new(env.locks.clone()),
        )
        .with_target_system(Arc::new(env.target.clone()))
    };
    let (a, b) = (make(), make());
    let (ra, rb) = tokio::join!(a.run(&pipeline), b.run(&pipeline));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert!(ra.is_success() && rb.is_success());
    assert_eq!(ra.applied_count() + rb.applied_count(), 4);
    let applied = env
        .trail()
        .await
        .into_iter()
        .filter(|(_, s)| *s == AuditState::Applied)
        .count();
    assert_eq!(applied, 4);
}

// ──────────────────────────────────────────────
// Failures
// ──────────────────────────────────────────────

#[tokio::test]
async fn failure_with_rollback_stops_the_run_and_records_rollback() {
    let env = Env::non_transactional();
    let pipeline = four_changes(&env, |c| c.failing().with_rollback(Step::Succeed));

    let summary = env.planner().run(&pipeline).await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.applied_count(), 2);
    assert_eq!(summary.failed_count(), 1);
    assert!(summary.outcome("c4").is_none());
    assert_eq!(summary.stages[0].not_reached, 1);

    let failed = summary.outcome("c3").unwrap();
    assert_eq!(failed.rollback, RollbackOutcome::Succeeded);
    let err = summary.failure().unwrap();
    assert_eq!(err.change_id, "c3");
    assert!(err.message.contains("c3 blew up"));

    let trail = env.trail().await;
    assert_eq!(
        &trail[4..],
        &[
            pair("c3", AuditState::Started),
            pair("c3", AuditState::Failed),
            pair("c3", AuditState::RolledBack),
        ]
    );
    assert!(env.target.get("c3").await.is_none());
    assert!(env.target.get("c4").await.is_none());
    assert!(env.ops().issues().await.unwrap().is_empty());
    assert!(env.lock_is_free().await);
}

#[tokio::test]
async fn failure_without_rollback_leaves_an_open_issue() {
    let env = Env::non_transactional();
    let pipeline = four_changes(&env, |c| c.failing());

    let summary = env.planner().run(&pipeline).await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(
        summary.outcome("c3").unwrap().rollback,
        RollbackOutcome::NotSupported
    );
    let trail = env.trail().await;
    assert_eq!(trail.last(), Some(&pair("c3", AuditState::Failed)));

    let issues = env.ops().issues().await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].change_id(), "c3");
    assert!(issues[0].error_trace().unwrap().contains("c3 blew up"));
}

#[tokio::test]
async fn open_issue_blocks_rerun_until_fixed() {
    let env = Env::non_transactional();
    env.planner()
        .run(&four_changes(&env, |c| c.failing()))
        .await
        .unwrap();
    let entries = env.ledger.len().await;

    let healthy = four_changes(&env, |c| c);
    let err = env.planner().run(&healthy).await.unwrap_err();
    let EngineError::ManualIntervention(blocked) = err else {
        panic!("expected manual intervention, got {err:?}");
    };
    assert_eq!(blocked.blocked.len(), 1);
    assert_eq!(blocked.blocked[0].change_id, "c3");
    assert_eq!(blocked.blocked[0].state, AuditState::Failed);
    assert!(blocked.to_string().contains("runway fix c3"));
    assert_eq!(env.ledger.len().await, entries);
    assert!(env.lock_is_free().await);

    let fix = env.ops().fix_issue("c3", Resolution::Applied).await.unwrap();
    assert!(matches!(fix, FixOutcome::Recorded { .. }));

    let summary = env.planner().run(&healthy).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.outcome("c3").unwrap().status, ChangeStatus::AlreadyApplied);
    assert_eq!(summary.outcome("c4").unwrap().status, ChangeStatus::Applied);
    assert_eq!(
        env.trail().await.last(),
        Some(&pair("c4", AuditState::Applied))
    );
}

#[tokio::test]
async fn always_retry_change_runs_again_after_failure() {
    let env = Env::non_transactional();
    let retrying = |c: TestChange| c.describe(|d| d.recovery(RecoveryStrategy::AlwaysRetry));
    env.planner()
        .run(&four_changes(&env, |c| retrying(c).failing()))
        .await
        .unwrap();

    let summary = env
        .planner()
        .run(&four_changes(&env, retrying))
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.applied_count(), 2);
    assert!(env.ops().issues().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_transactional_change_is_retried_without_intervention() {
    let env = Env::new(InMemoryTargetSystem::transactional("db"));
    let summary = env
        .planner()
        .run(&four_changes(&env, |c| c.failing()))
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(
        summary.outcome("c3").unwrap().rollback,
        RollbackOutcome::Succeeded
    );
    assert!(env.target.get("c3").await.is_none());

    let summary = env.planner().run(&four_changes(&env, |c| c)).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(env.target.get("c3").await, Some(json!("applied")));
    assert_eq!(env.target.get("c4").await, Some(json!("applied")));
}

#[tokio::test]
async fn start_audit_failure_does_not_block_the_change() {
    let env = Env::non_transactional();
    env.ledger.reject_appends_in_state(AuditState::Started).await;

    let summary = env
        .planner()
        .run(&single_stage(vec![TestChange::new("c1", &env.target)]))
        .await
        .unwrap();

    assert!(summary.is_success());
    let outcome = summary.outcome("c1").unwrap();
    assert_eq!(outcome.status, ChangeStatus::Applied);
    assert_eq!(outcome.audit_failures.len(), 1);
    assert_eq!(outcome.audit_failures[0].state, AuditState::Started);
    assert_eq!(env.trail().await, vec![pair("c1", AuditState::Applied)]);
}

// ──────────────────────────────────────────────
// Strategies
// ──────────────────────────────────────────────

#[tokio::test]
async fn shared_transaction_writes_audit_through_the_target() {
    let ledger = InMemoryAuditLedger::new();
    let mut env = Env::new(InMemoryTargetSystem::in_sync_with("db", ledger.clone()));
    env.ledger = ledger;

    let summary = env
        .planner()
        .run(&single_stage(vec![
            TestChange::new("c1", &env.target),
            TestChange::new("c2", &env.target).describe(|d| d.transactional(false)),
        ]))
        .await
        .unwrap();

    assert!(summary.is_success());
    let history = env.ledger.history().await.unwrap();
    let tx_types: Vec<_> = history.iter().map(|e| (e.change_id.as_str(), e.tx_type)).collect();
    assert_eq!(
        tx_types,
        vec![
            ("c1", TxType::TxShared),
            ("c1", TxType::TxShared),
            ("c2", TxType::NonTx),
            ("c2", TxType::NonTx),
        ]
    );
    assert_eq!(history[1].transaction_flag, None);
    assert_eq!(history[3].transaction_flag, Some(false));
    assert_eq!(env.target.contents().await.len(), 2);
}

// ──────────────────────────────────────────────
// Lock
// ──────────────────────────────────────────────

async fn held_by_someone_else(env: &Env) {
    env.locks
        .insert_raw(LockEntry::held(
            LOCK_KEY,
            "other-runner",
            60_000,
            OffsetDateTime::now_utc(),
        ))
        .await;
}

#[tokio::test]
async fn contended_lock_times_out() {
    let env = Env::non_transactional();
    held_by_someone_else(&env).await;

    let err = env
        .planner()
        .run(&four_changes(&env, |c| c))
        .await
        .unwrap_err();
    let EngineError::Lock(lock) = err else {
        panic!("expected a lock error, got {err:?}");
    };
    assert_eq!(lock.kind, LockFailureKind::AcquisitionTimeout);
    assert_eq!(lock.current_owner.as_deref(), Some("other-runner"));
    assert!(env.ledger.is_empty().await);
}

#[tokio::test]
async fn contended_lock_degrades_when_configured() {
    let mut env = Env::non_transactional();
    env.config.lock.throw_on_failure = false;
    held_by_someone_else(&env).await;

    let summary = env
        .planner()
        .run(&four_changes(&env, |c| c))
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::LockUnavailable);
    assert!(!summary.is_success());
    assert_eq!(
        summary.lock_error.as_ref().map(|e| e.kind),
        Some(LockFailureKind::AcquisitionTimeout)
    );
    assert!(summary.outcomes.is_empty());
    assert!(env.ledger.is_empty().await);
}

#[tokio::test]
async fn stale_lock_of_crashed_runner_is_reclaimed() {
    let env = Env::non_transactional();
    env.locks
        .insert_raw(LockEntry::held(
            LOCK_KEY,
            "crashed-runner",
            1,
            OffsetDateTime::now_utc() - time::Duration::minutes(5),
        ))
        .await;

    let summary = env.planner().run(&four_changes(&env, |c| c)).await.unwrap();
    assert!(summary.is_success());
    assert!(env.lock_is_free().await);
}

#[tokio::test]
async fn lost_lease_stops_before_the_next_change() {
    let mut env = Env::non_transactional();
    env.config.lock.lease_millis = 300;
    let pipeline = single_stage(vec![
        TestChange::new("c1", &env.target).applying(Step::StealLock(env.locks.clone())),
        TestChange::new("c2", &env.target),
    ]);

    let err = env.planner().run(&pipeline).await.unwrap_err();
    let EngineError::Lock(lock) = err else {
        panic!("expected a lock error, got {err:?}");
    };
    assert_eq!(lock.kind, LockFailureKind::RefreshFailed);
    assert_eq!(lock.current_owner.as_deref(), Some("intruder"));
    assert_eq!(
        env.trail().await,
        vec![pair("c1", AuditState::Started), pair("c1", AuditState::Applied)]
    );
    assert!(env.target.get("c2").await.is_none());
}

#[tokio::test]
async fn interrupt_stops_between_changes() {
    let env = Env::non_transactional();
    let (tx, rx) = watch::channel(false);
    let pipeline = single_stage(vec![
        TestChange::new("c1", &env.target).applying(Step::Interrupt(Arc::new(tx))),
        TestChange::new("c2", &env.target),
    ]);

    let err = env
        .planner()
        .with_interrupt(rx)
        .run(&pipeline)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Lock(ref e) if e.kind == LockFailureKind::ProcessInterrupted
    ));
    assert_eq!(env.trail().await.len(), 2);
    assert!(env.lock_is_free().await);
}

#[tokio::test]
async fn interrupt_while_waiting_for_the_lock() {
    let mut env = Env::non_transactional();
    env.config.lock.quit_trying_after_millis = 60_000;
    held_by_someone_else(&env).await;
    let (tx, rx) = watch::channel(false);

    let planner = env.planner().with_interrupt(rx);
    let pipeline = four_changes(&env, |c| c);
    let run = planner.run(&pipeline);
    let interrupt = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    };
    let (result, ()) = tokio::join!(run, interrupt);

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Lock(ref e) if e.kind == LockFailureKind::ProcessInterrupted
    ));
}

// ──────────────────────────────────────────────
// Pipeline shape and target systems
// ──────────────────────────────────────────────

#[tokio::test]
async fn stages_run_in_order_with_their_own_ids() {
    let env = Env::non_transactional();
    let pipeline = Pipeline::new()
        .with_stage(
            Stage::new("schema")
                .with_change(TestChange::new("s1", &env.target))
                .with_change(TestChange::new("s2", &env.target)),
        )
        .with_stage(Stage::new("data").with_change(TestChange::new("d1", &env.target)));

    let summary = env.planner().run(&pipeline).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.stages.len(), 2);
    assert_eq!(summary.stages[0].stage_id, "schema");
    assert_eq!(summary.stages[0].applied, 2);
    assert_eq!(summary.stages[1].applied, 1);
    let history = env.ledger.history().await.unwrap();
    let stages: Vec<_> = history
        .iter()
        .filter(|e| e.state == AuditState::Applied)
        .map(|e| (e.change_id.as_str(), e.stage_id.as_str()))
        .collect();
    assert_eq!(stages, vec![("s1", "schema"), ("s2", "schema"), ("d1", "data")]);
}

#[tokio::test]
async fn duplicate_change_ids_are_rejected() {
    let env = Env::non_transactional();
    let pipeline = single_stage(vec![
        TestChange::new("c1", &env.target),
        TestChange::new("c1", &env.target),
    ]);
    let err = env.planner().run(&pipeline).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateChange { ref change_id } if change_id == "c1"));
    assert!(env.ledger.is_empty().await);
}

#[tokio::test]
async fn unknown_target_system_fails_before_anything_runs() {
    let env = Env::non_transactional();
    let pipeline = single_stage(vec![
        TestChange::new("c1", &env.target),
        TestChange::new("c2", &env.target).describe(|d| d.target_system("warehouse")),
    ]);

    let err = env.planner().run(&pipeline).await.unwrap_err();
    let EngineError::TargetSystemResolution(resolution) = err else {
        panic!("expected a resolution error, got {err:?}");
    };
    assert_eq!(resolution.change_id, "c2");
    assert_eq!(resolution.target_system_id, "warehouse");
    assert!(resolution.available.contains(&"files".to_string()));
    assert!(env.ledger.is_empty().await);
    assert!(env.lock_is_free().await);
}

#[tokio::test]
async fn relaxed_resolution_falls_back_to_the_default_target() {
    let mut env = Env::non_transactional();
    env.config.target_systems.strict = false;
    let pipeline = single_stage(vec![
        TestChange::new("c1", &env.target).describe(|d| d.target_system("warehouse"))
    ]);

    let summary = env.planner().run(&pipeline).await.unwrap();
    assert!(summary.is_success());
    let history = env.ledger.history().await.unwrap();
    assert!(history.iter().all(|e| e.target_system_id == "default"));
}

#[tokio::test]
async fn markers_left_by_a_crashed_runner_are_reported() {
    let env = Env::new(InMemoryTargetSystem::transactional("db").with_ongoing_tasks());
    let markers = env.target.ongoing_tasks().unwrap();
    markers.mark_in_flight("ghost").await.unwrap();

    let summary = env
        .planner()
        .run(&single_stage(vec![TestChange::new("c1", &env.target)]))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.interrupted_changes, vec!["ghost".to_string()]);
    assert_eq!(markers.ids().await, vec!["ghost".to_string()]);
    assert!(summary.to_string().contains("ghost"));
}

// ──────────────────────────────────────────────
// File-backed ledger
// ──────────────────────────────────────────────

#[tokio::test]
async fn json_lines_ledger_survives_across_planners() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let target = InMemoryTargetSystem::non_transactional("files");
    let locks = InMemoryLockService::new();
    let mut config = EngineConfig::default();
    config.lock.retry_frequency_millis = 10;

    let planner = |config: &EngineConfig| {
        ExecutionPlanner::new(
            config.clone(),
            Arc::new(JsonLinesLedger::new(&path)),
            Arc::new(locks.clone()),
        )
        .with_target_system(Arc::new(target.clone()))
    };
    let failing = single_stage(vec![
        TestChange::new("c1", &target),
        TestChange::new("c2", &target).failing(),
    ]);
    planner(&config).run(&failing).await.unwrap();

    let reopened = OpsClient::new(Arc::new(JsonLinesLedger::new(&path)));
    let issue = reopened.issue_by_change_id("c2").await.unwrap().unwrap();
    assert_eq!(issue.entry.state, AuditState::Failed);
    assert_eq!(issue.history.len(), 2);

    reopened
        .fix_issue("c2", Resolution::RolledBack)
        .await
        .unwrap();
    let healthy = single_stage(vec![
        TestChange::new("c1", &target),
        TestChange::new("c2", &target),
    ]);
    let summary = planner(&config).run(&healthy).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.applied_count(), 1);

    let states: Vec<AuditState> = reopened
        .change_history("c2")
        .await
        .unwrap()
        .iter()
        .map(|e: &AuditEntry| e.state)
        .collect();
    assert_eq!(
        states,
        vec![
            AuditState::Started,
            AuditState::Failed,
            AuditState::ManualMarkedAsRolledBack,
            AuditState::Started,
            AuditState::Applied,
        ]
    );
}
