//! Lease-based distributed lock held for the duration of a run.
//!
//! [`LeaseLock::acquire`] retries the backend's conditional upsert until it
//! wins or gives up. The returned [`LockGuard`] optionally refreshes the
//! lease in a background task and publishes its health through a
//! [`LockHealth`] handle, which the planner and change contexts consult
//! before doing work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use runway_storage::{LockAcquisition, LockService, LockServiceError};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{LockError, LockFailureKind};
use crate::runner::RunnerId;

#[derive(Debug, Clone)]
struct LeaseState {
    /// `None` for a detached handle that never expires.
    expires_at: Option<OffsetDateTime>,
    lost: Option<LockError>,
}

/// Read-only view of whether the current run still holds its lease.
#[derive(Debug, Clone)]
pub struct LockHealth {
    key: String,
    owner: String,
    state: watch::Receiver<LeaseState>,
}

impl LockHealth {
    /// A handle for work done outside any lock; always healthy.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(LeaseState {
            expires_at: None,
            lost: None,
        });
        Self {
            key: String::new(),
            owner: String::new(),
            state: rx,
        }
    }

    /// Fails when a refresh was refused or the lease has locally expired.
    pub fn ensure_held(&self) -> Result<(), LockError> {
        let state = self.state.borrow();
        if let Some(lost) = &state.lost {
            return Err(lost.clone());
        }
        if let Some(expires_at) = state.expires_at {
            if expires_at <= OffsetDateTime::now_utc() {
                let mut err = LockError::new(LockFailureKind::Expired, &self.key, &self.owner)
                    .with_cause("lease expired before it could be extended");
                err.expires_at = Some(expires_at);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.state.borrow().expires_at
    }
}

/// Acquisition side of the lock: who wants which key, and how hard to try.
pub struct LeaseLock {
    service: Arc<dyn LockService>,
    key: String,
    owner: RunnerId,
    lease_millis: u64,
    retry_frequency_millis: u64,
    quit_trying_after_millis: u64,
    interrupt: Option<watch::Receiver<bool>>,
}

impl LeaseLock {
    pub fn new(service: Arc<dyn LockService>, owner: RunnerId, config: &LockConfig) -> Self {
        Self {
            service,
            key: config.key.clone(),
            owner,
            lease_millis: config.lease_millis,
            retry_frequency_millis: config.retry_frequency_millis,
            quit_trying_after_millis: config.quit_trying_after_millis,
            interrupt: None,
        }
    }

    /// Abort acquisition as soon as `interrupt` turns true.
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// One acquisition attempt, without waiting.
    pub async fn try_acquire(&self) -> Result<LockGuard, LockError> {
        match self
            .service
            .upsert(&self.key, self.owner.as_str(), self.lease_millis)
            .await
        {
            Ok(acquisition) => {
                info!(
                    key = %self.key,
                    owner = %self.owner,
                    expires_at = %acquisition.expires_at,
                    "lock acquired"
                );
                Ok(LockGuard::new(
                    self.service.clone(),
                    self.lease_millis,
                    acquisition,
                ))
            }
            Err(LockServiceError::AlreadyOwned {
                current_owner,
                expires_at,
                ..
            }) => {
                let mut err =
                    LockError::new(LockFailureKind::AlreadyOwned, &self.key, self.owner.as_str());
                err.attempts = 1;
                err.current_owner = Some(current_owner);
                err.expires_at = Some(expires_at);
                Err(err)
            }
            Err(e) => Err(
                LockError::new(LockFailureKind::Unknown, &self.key, self.owner.as_str())
                    .with_cause(e),
            ),
        }
    }

    /// Try to acquire the lock, sleeping `retry_frequency_millis` between
    /// attempts, until `quit_trying_after_millis` would be exceeded.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let retry = Duration::from_millis(self.retry_frequency_millis);
        let give_up_after = Duration::from_millis(self.quit_trying_after_millis);
        let mut interrupt = self.interrupt.clone();
        let mut attempts = 0u32;
        let mut last_holder: Option<String> = None;
        let mut last_cause: Option<String> = None;

        loop {
            if interrupt.as_ref().is_some_and(|rx| *rx.borrow()) {
                let mut err = self.failure(LockFailureKind::ProcessInterrupted, attempts, started);
                err.current_owner = last_holder;
                return Err(err.with_cause("interrupted while waiting for the lock"));
            }

            attempts += 1;
            debug!(key = %self.key, owner = %self.owner, attempt = attempts, "attempting to acquire lock");
            match self
                .service
                .upsert(&self.key, self.owner.as_str(), self.lease_millis)
                .await
            {
                Ok(acquisition) => {
                    info!(
                        key = %self.key,
                        owner = %self.owner,
                        expires_at = %acquisition.expires_at,
                        attempts,
                        "lock acquired"
                    );
                    return Ok(LockGuard::new(
                        self.service.clone(),
                        self.lease_millis,
                        acquisition,
                    ));
                }
                Err(LockServiceError::AlreadyOwned {
                    current_owner,
                    expires_at,
                    ..
                }) => {
                    debug!(key = %self.key, holder = %current_owner, %expires_at, "lock held by another runner");
                    last_holder = Some(current_owner);
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "lock backend error during acquisition");
                    last_cause = Some(e.to_string());
                }
            }

            if started.elapsed() + retry > give_up_after {
                let mut err = self.failure(LockFailureKind::AcquisitionTimeout, attempts, started);
                err.current_owner = last_holder;
                err.cause = last_cause;
                return Err(err);
            }

            let sender_gone = match interrupt.as_mut() {
                Some(rx) => tokio::select! {
                    _ = tokio::time::sleep(retry) => false,
                    changed = rx.changed() => changed.is_err(),
                },
                None => {
                    tokio::time::sleep(retry).await;
                    false
                }
            };
            if sender_gone {
                interrupt = None;
            }
        }
    }

    fn failure(&self, kind: LockFailureKind, attempts: u32, started: Instant) -> LockError {
        let mut err = LockError::new(kind, &self.key, self.owner.as_str());
        err.attempts = attempts;
        err.waited_millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        err
    }
}

/// A held lease. Release it explicitly with [`LockGuard::release`]; dropping
/// an unreleased guard schedules a best-effort release on the runtime.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    owner: String,
    lease_millis: u64,
    state: Arc<watch::Sender<LeaseState>>,
    health: LockHealth,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    fn new(service: Arc<dyn LockService>, lease_millis: u64, acquisition: LockAcquisition) -> Self {
        let (tx, rx) = watch::channel(LeaseState {
            expires_at: Some(acquisition.expires_at),
            lost: None,
        });
        Self {
            health: LockHealth {
                key: acquisition.key.clone(),
                owner: acquisition.owner.clone(),
                state: rx,
            },
            service,
            key: acquisition.key,
            owner: acquisition.owner,
            lease_millis,
            state: Arc::new(tx),
            refresher: None,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn health(&self) -> LockHealth {
        self.health.clone()
    }

    /// Extend the lease once. A refusal marks the lock as lost.
    pub async fn extend(&self) -> Result<LockAcquisition, LockError> {
        renew(
            self.service.as_ref(),
            &self.key,
            &self.owner,
            self.lease_millis,
            &self.state,
        )
        .await
    }

    /// Spawn a task extending the lease every third of its length. The task
    /// stops at the first failed extension.
    pub fn start_refresh(&mut self) {
        if self.refresher.is_some() {
            return;
        }
        let period = Duration::from_millis((self.lease_millis / 3).max(1));
        let service = self.service.clone();
        let key = self.key.clone();
        let owner = self.owner.clone();
        let lease_millis = self.lease_millis;
        let state = self.state.clone();

        self.refresher = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match renew(service.as_ref(), &key, &owner, lease_millis, &state).await {
                    Ok(acquisition) => {
                        debug!(key = %key, expires_at = %acquisition.expires_at, "lock lease extended");
                    }
                    Err(err) => {
                        warn!(error = %err, "lock refresh failed");
                        break;
                    }
                }
            }
        }));
        debug!(
            key = %self.key,
            period_millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "lock refresh started"
        );
    }

    /// Stop refreshing and delete the key. The guard is consumed either way.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if let Some(handle) = self.refresher.take() {
            handle.abort();
        }
        self.service
            .release(&self.key, &self.owner)
            .await
            .map_err(|e| {
                LockError::new(LockFailureKind::ReleaseFailed, &self.key, &self.owner).with_cause(e)
            })?;
        info!(key = %self.key, owner = %self.owner, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.take() {
            handle.abort();
        }
        if self.released {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let service = self.service.clone();
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            runtime.spawn(async move {
                match service.release(&key, &owner).await {
                    Ok(()) => debug!(key = %key, "lock released on drop"),
                    Err(e) => warn!(key = %key, error = %e, "lock release on drop failed"),
                }
            });
        } else {
            warn!(key = %self.key, "lock guard dropped outside a runtime; lease will expire on its own");
        }
    }
}

async fn renew(
    service: &dyn LockService,
    key: &str,
    owner: &str,
    lease_millis: u64,
    state: &watch::Sender<LeaseState>,
) -> Result<LockAcquisition, LockError> {
    match service.extend(key, owner, lease_millis).await {
        Ok(acquisition) => {
            state.send_modify(|s| s.expires_at = Some(acquisition.expires_at));
            Ok(acquisition)
        }
        Err(e) => {
            let mut err = LockError::new(LockFailureKind::RefreshFailed, key, owner).with_cause(&e);
            if let LockServiceError::NotOwner { current_owner, .. } = &e {
                err.current_owner = current_owner.clone();
            }
            state.send_modify(|s| s.lost = Some(err.clone()));
            Err(err)
        }
    }
}
