use std::future::Future;
use std::time::Duration;

use super::TestResult;
use crate::{LockService, LockServiceError};

const KEY: &str = "conformance-lock";
const LONG_LEASE: u64 = 60_000;
const SHORT_LEASE: u64 = 40;

pub(super) async fn run_lock_tests<K, F, Fut>(factory: &F) -> Vec<TestResult>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "lock",
        "get_absent_key_returns_none",
        get_absent_key_returns_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "upsert_free_key_succeeds",
        upsert_free_key_succeeds(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "upsert_same_owner_is_idempotent",
        upsert_same_owner_is_idempotent(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "upsert_other_owner_fails_while_unexpired",
        upsert_other_owner_fails_while_unexpired(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "upsert_reclaims_expired_lease",
        upsert_reclaims_expired_lease(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "extend_by_owner_pushes_expiry",
        extend_by_owner_pushes_expiry(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "extend_by_other_owner_fails",
        extend_by_other_owner_fails(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "release_by_non_owner_is_ignored",
        release_by_non_owner_is_ignored(factory).await,
    ));
    results.push(TestResult::from_result(
        "lock",
        "release_by_owner_frees_key",
        release_by_owner_frees_key(factory).await,
    ));

    results
}

// ── 1. Nothing held ─────────────────────────────────────────────────────────

async fn get_absent_key_returns_none<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    match locks.get(KEY).await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {:?}", other)),
    }
}

// ── 2. First acquisition ────────────────────────────────────────────────────

async fn upsert_free_key_succeeds<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    let acquisition = locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    if acquisition.owner != "runner-a" {
        return Err(format!("expected owner runner-a, got {}", acquisition.owner));
    }
    let held = locks
        .get(KEY)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("lock not visible after upsert")?;
    if held.owner != "runner-a" {
        return Err(format!("expected stored owner runner-a, got {}", held.owner));
    }
    Ok(())
}

// ── 3. Re-acquire by the holder ─────────────────────────────────────────────

async fn upsert_same_owner_is_idempotent<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("first upsert: {e}"))?;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("second upsert by same owner: {e}"))?;
    Ok(())
}

// ── 4. Contention ───────────────────────────────────────────────────────────

async fn upsert_other_owner_fails_while_unexpired<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    match locks.upsert(KEY, "runner-b", LONG_LEASE).await {
        Err(LockServiceError::AlreadyOwned { current_owner, .. }) => {
            if current_owner != "runner-a" {
                return Err(format!(
                    "expected current_owner runner-a, got {}",
                    current_owner
                ));
            }
        }
        other => return Err(format!("expected AlreadyOwned, got {:?}", other)),
    }
    let held = locks
        .get(KEY)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("lock disappeared")?;
    if held.owner != "runner-a" {
        return Err(format!("losing upsert changed owner to {}", held.owner));
    }
    Ok(())
}

// ── 5. A lapsed lease is up for grabs ───────────────────────────────────────

async fn upsert_reclaims_expired_lease<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "crashed-runner", SHORT_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    tokio::time::sleep(Duration::from_millis(SHORT_LEASE * 3)).await;
    let acquisition = locks
        .upsert(KEY, "fresh-runner", LONG_LEASE)
        .await
        .map_err(|e| format!("reclaim after expiry: {e}"))?;
    if acquisition.owner != "fresh-runner" {
        return Err(format!("expected fresh-runner, got {}", acquisition.owner));
    }
    Ok(())
}

// ── 6. Extension by the holder ──────────────────────────────────────────────

async fn extend_by_owner_pushes_expiry<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    let first = locks
        .upsert(KEY, "runner-a", SHORT_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    let extended = locks
        .extend(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("extend: {e}"))?;
    if extended.expires_at <= first.expires_at {
        return Err(format!(
            "expected expiry after {}, got {}",
            first.expires_at, extended.expires_at
        ));
    }
    Ok(())
}

// ── 7. Extension by someone else ────────────────────────────────────────────

async fn extend_by_other_owner_fails<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    match locks.extend(KEY, "runner-b", LONG_LEASE).await {
        Err(LockServiceError::NotOwner { .. }) => {}
        other => return Err(format!("expected NotOwner, got {:?}", other)),
    }
    match locks.extend("never-acquired", "runner-a", LONG_LEASE).await {
        Err(LockServiceError::NotOwner { current_owner, .. }) if current_owner.is_none() => Ok(()),
        other => Err(format!(
            "expected NotOwner without current owner, got {:?}",
            other
        )),
    }
}

// ── 8. Release is owner-only and silent otherwise ───────────────────────────

async fn release_by_non_owner_is_ignored<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    locks
        .release(KEY, "runner-b")
        .await
        .map_err(|e| format!("release by non-owner should not error: {e}"))?;
    let held = locks.get(KEY).await.map_err(|e| format!("get: {e}"))?;
    match held {
        Some(a) if a.owner == "runner-a" => Ok(()),
        other => Err(format!("expected lock still held by runner-a, got {:?}", other)),
    }
}

// ── 9. Release by the holder ────────────────────────────────────────────────

async fn release_by_owner_frees_key<K, F, Fut>(factory: &F) -> Result<(), String>
where
    K: LockService,
    F: Fn() -> Fut,
    Fut: Future<Output = K>,
{
    let locks = factory().await;
    locks
        .upsert(KEY, "runner-a", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    locks
        .release(KEY, "runner-a")
        .await
        .map_err(|e| format!("release: {e}"))?;
    if locks.get(KEY).await.map_err(|e| format!("get: {e}"))?.is_some() {
        return Err("lock still present after release".to_string());
    }
    locks
        .upsert(KEY, "runner-b", LONG_LEASE)
        .await
        .map_err(|e| format!("upsert after release: {e}"))?;
    Ok(())
}
