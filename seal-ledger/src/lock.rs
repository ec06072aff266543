//! Commit lock
//!
//! One lock document per ledger serializes commits. A [`LockLease`] is
//! handed out on acquisition; while it lives a heartbeat task extends the
//! expiry. A renewal that no longer matches `(key, owner)` means another
//! process took the lock over, and the lease is flagged lost.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::{LedgerStore, LockFilter};
use crate::types::{LedgerKind, LockClaim, LockRecord};

const MIN_TTL_MS: u64 = 1_000;
const MIN_STALE_MS: u64 = 60_000;
const MIN_HEARTBEAT_MS: u64 = 500;
const MAX_HEARTBEAT_MS: u64 = 15_000;
const MIN_UNLOCK_AGE_MS: u64 = 1_000;
const MAX_UNLOCK_AGE_MS: u64 = 86_400_000;

/// Effective lock timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Lease length
    pub ttl_ms: u64,
    /// Unrenewed locks older than this may be taken over
    pub stale_ms: u64,
    /// Expiries further ahead than this are treated as corrupt
    pub invalid_future_ms: u64,
    /// Heartbeat period
    pub heartbeat_ms: u64,
}

impl LockPolicy {
    /// Derive timings from configuration
    pub fn from_config(config: &LockConfig) -> Self {
        let max_ttl = config.max_ttl_ms.max(MIN_TTL_MS);
        let ttl_ms = config.ttl_ms.max(MIN_TTL_MS).min(max_ttl);
        let stale_ms = config
            .stale_ms
            .unwrap_or_else(|| MIN_STALE_MS.max(ttl_ms * 2))
            .max(ttl_ms * 2);
        let invalid_future_ms = config.invalid_future_ms.unwrap_or(max_ttl * 2);
        let heartbeat_ms = (ttl_ms / 2).clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS);
        Self {
            ttl_ms,
            stale_ms,
            invalid_future_ms,
            heartbeat_ms,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
    }

    /// Claim parameters for `owner` at `now`
    pub fn claim(&self, key: &str, owner: &str, now: DateTime<Utc>) -> LockClaim {
        LockClaim {
            key: key.to_string(),
            owner: owner.to_string(),
            now,
            expires_at: now + Self::ms(self.ttl_ms),
            stale_before: now - Self::ms(self.stale_ms),
            invalid_after: now + Self::ms(self.invalid_future_ms),
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Self::ms(self.ttl_ms)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

/// Lock document as shown to admins
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Lock key
    pub key: String,
    /// Owner token
    pub owner: Option<String>,
    /// Expiry, raw when corrupt
    pub expires_at: Option<String>,
    /// Last renewal, raw when corrupt
    pub updated_at: Option<String>,
    /// First acquisition
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry is a valid timestamp in the past, or unusable
    pub expired: bool,
}

impl LockInfo {
    fn from_record(record: &LockRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: record.key.clone(),
            owner: record.owner.clone(),
            expires_at: record.expires_at.describe(),
            updated_at: record.updated_at.describe(),
            created_at: record.created_at,
            expired: record.expires_at.at().map_or(true, |ts| ts <= now),
        }
    }
}

/// Admin unlock request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockRequest {
    /// Remove this key
    pub key: Option<String>,
    /// Remove every lock
    pub all: bool,
    /// With `all`: only locks not renewed within `max_age_ms`
    pub stale_only: bool,
    /// Staleness threshold, defaults to the policy's stale window
    pub max_age_ms: Option<u64>,
}

/// Which unlock mode ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMode {
    /// Single key
    One,
    /// Every lock
    All,
    /// Every stale lock
    AllStale,
}

/// Result of an admin unlock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockOutcome {
    /// Mode
    pub mode: UnlockMode,
    /// Number of deleted documents
    pub deleted: usize,
    /// Deleted keys
    pub keys: Vec<String>,
}

/// Acquires and administers commit locks
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn LedgerStore>,
    policy: LockPolicy,
    metrics: Arc<Metrics>,
}

impl LockManager {
    /// Create a lock manager
    pub fn new(store: Arc<dyn LedgerStore>, policy: LockPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    /// Effective timings
    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Fresh owner token
    pub fn new_owner() -> String {
        format!("srv:{}", Uuid::new_v4())
    }

    /// Try to take the commit lock of `kind` under a fresh owner token
    pub async fn try_acquire(&self, kind: LedgerKind) -> Result<Option<LockLease>> {
        self.try_acquire_as(kind, Self::new_owner()).await
    }

    /// Try to take the commit lock of `kind` as `owner`.
    ///
    /// On success a heartbeat task starts renewing the lease.
    pub async fn try_acquire_as(&self, kind: LedgerKind, owner: String) -> Result<Option<LockLease>> {
        let now = Utc::now();
        let key = kind.lock_key();
        let claim = self.policy.claim(key, &owner, now);
        let record = self.store.claim_lock(kind, &claim).await?;

        let owned = record.owner.as_deref() == Some(owner.as_str());
        let live = record.expires_at.at().map_or(false, |ts| ts > now);
        if !(owned && live) {
            debug!(ledger = %kind, key, holder = ?record.owner, "ledger_lock_busy");
            return Ok(None);
        }

        debug!(ledger = %kind, key, owner = %owner, "ledger_lock_acquired");
        Ok(Some(LockLease::start(
            kind,
            key.to_string(),
            owner,
            self.store.clone(),
            self.policy,
            self.metrics.clone(),
        )))
    }

    /// Lock document of `kind`'s commit lock
    pub async fn lock_info(&self, kind: LedgerKind) -> Result<Option<LockInfo>> {
        let now = Utc::now();
        Ok(self
            .store
            .get_lock(kind, kind.lock_key())
            .await?
            .map(|r| LockInfo::from_record(&r, now)))
    }

    /// Every lock document of `kind`
    pub async fn list_locks(&self, kind: LedgerKind) -> Result<Vec<LockInfo>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_locks(kind)
            .await?
            .iter()
            .map(|r| LockInfo::from_record(r, now))
            .collect())
    }

    /// Remove lock documents by key, all, or all stale
    pub async fn admin_unlock(&self, kind: LedgerKind, request: &UnlockRequest) -> Result<UnlockOutcome> {
        if let Some(age) = request.max_age_ms {
            if !(MIN_UNLOCK_AGE_MS..=MAX_UNLOCK_AGE_MS).contains(&age) {
                return Err(Error::Validation(format!(
                    "maxAgeMs must be between {} and {}",
                    MIN_UNLOCK_AGE_MS, MAX_UNLOCK_AGE_MS
                )));
            }
        }

        let (mode, filter) = match (&request.key, request.all) {
            (Some(_), true) => {
                return Err(Error::Validation("Provide either key or all, not both".to_string()))
            }
            (None, false) => return Err(Error::Validation("Provide key or all".to_string())),
            (Some(key), false) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::Validation("key must not be empty".to_string()));
                }
                (UnlockMode::One, LockFilter::Key(key.to_string()))
            }
            (None, true) if request.stale_only => {
                let age = request.max_age_ms.unwrap_or(self.policy.stale_ms);
                let cutoff = Utc::now() - LockPolicy::ms(age);
                (UnlockMode::AllStale, LockFilter::UpdatedBefore(cutoff))
            }
            (None, true) => (UnlockMode::All, LockFilter::All),
        };

        let keys = self.store.delete_locks(kind, &filter).await?;
        info!(ledger = %kind, mode = ?mode, deleted = keys.len(), "ledger_admin_unlock");
        Ok(UnlockOutcome {
            mode,
            deleted: keys.len(),
            keys,
        })
    }
}

/// A held commit lock with its heartbeat
#[derive(Debug)]
pub struct LockLease {
    kind: LedgerKind,
    key: String,
    owner: String,
    store: Arc<dyn LedgerStore>,
    policy: LockPolicy,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockLease {
    fn start(
        kind: LedgerKind,
        key: String,
        owner: String,
        store: Arc<dyn LedgerStore>,
        policy: LockPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            kind,
            key.clone(),
            owner.clone(),
            store.clone(),
            policy,
            lost.clone(),
            stop.clone(),
            metrics,
        ));
        Self {
            kind,
            key,
            owner,
            store,
            policy,
            lost,
            stop,
            heartbeat: Some(heartbeat),
        }
    }

    /// Owner token
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lock key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Another owner took the lock over
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Renew once now; false (and flagged lost) if the lock is no longer ours
    pub async fn renew(&self) -> Result<bool> {
        let now = Utc::now();
        let renewed = self
            .store
            .renew_lock(self.kind, &self.key, &self.owner, self.policy.expiry(now), now)
            .await?;
        if !renewed {
            self.lost.store(true, Ordering::SeqCst);
        }
        Ok(renewed)
    }

    /// Stop the heartbeat and delete the lock if still ours
    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.await;
        }
        let released = self
            .store
            .release_lock(self.kind, &self.key, &self.owner)
            .await?;
        debug!(ledger = %self.kind, key = %self.key, released, "ledger_lock_released");
        Ok(())
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat(
    kind: LedgerKind,
    key: String,
    owner: String,
    store: Arc<dyn LedgerStore>,
    policy: LockPolicy,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    metrics: Arc<Metrics>,
) {
    let period = std::time::Duration::from_millis(policy.heartbeat_ms);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                match store.renew_lock(kind, &key, &owner, policy.expiry(now), now).await {
                    Ok(true) => {}
                    Ok(false) => {
                        lost.store(true, Ordering::SeqCst);
                        metrics.record_heartbeat_lost(kind);
                        warn!(ledger = %kind, key = %key, owner = %owner, "ledger_lock_heartbeat_lost");
                        break;
                    }
                    Err(e) => {
                        warn!(ledger = %kind, key = %key, error = %e, "ledger_lock_heartbeat_error");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use crate::types::RecordedTime;

    fn manager(store: Arc<MemoryLedgerStore>, policy: LockPolicy) -> LockManager {
        LockManager::new(store, policy, Arc::new(Metrics::new().unwrap()))
    }

    #[test]
    fn test_policy_defaults() {
        let policy = LockPolicy::default();
        assert_eq!(policy.ttl_ms, 30_000);
        assert_eq!(policy.stale_ms, 60_000);
        assert_eq!(policy.invalid_future_ms, 120_000);
        assert_eq!(policy.heartbeat_ms, 15_000);
    }

    #[test]
    fn test_policy_clamps() {
        let policy = LockPolicy::from_config(&LockConfig {
            ttl_ms: 10,
            max_ttl_ms: 60_000,
            stale_ms: Some(5),
            invalid_future_ms: None,
        });
        assert_eq!(policy.ttl_ms, 1_000);
        assert_eq!(policy.stale_ms, 2_000);
        assert_eq!(policy.heartbeat_ms, 500);

        let policy = LockPolicy::from_config(&LockConfig {
            ttl_ms: 500_000,
            max_ttl_ms: 40_000,
            stale_ms: None,
            invalid_future_ms: None,
        });
        assert_eq!(policy.ttl_ms, 40_000);
        assert_eq!(policy.stale_ms, 80_000);
        assert_eq!(policy.invalid_future_ms, 80_000);
    }

    #[tokio::test]
    async fn test_single_holder() {
        let store = Arc::new(MemoryLedgerStore::new());
        let locks = manager(store.clone(), LockPolicy::default());
        let kind = LedgerKind::Settlement;

        let lease = locks.try_acquire(kind).await.unwrap().unwrap();
        assert!(lease.owner().starts_with("srv:"));
        assert!(locks.try_acquire(kind).await.unwrap().is_none());
        // The other ledger has its own lock
        let audit = locks.try_acquire(LedgerKind::Audit).await.unwrap().unwrap();

        lease.release().await.unwrap();
        audit.release().await.unwrap();
        assert!(locks.lock_info(kind).await.unwrap().is_none());
        assert!(locks.try_acquire(kind).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_takeover_of_corrupt_and_stale_locks() {
        let store = Arc::new(MemoryLedgerStore::new());
        let locks = manager(store.clone(), LockPolicy::default());
        let kind = LedgerKind::Audit;
        let now = Utc::now();

        store.put_lock(
            kind,
            LockRecord {
                key: kind.lock_key().into(),
                owner: Some("srv:crashed".into()),
                expires_at: RecordedTime::Corrupt(serde_json::json!("tomorrow")),
                updated_at: RecordedTime::At(now),
                created_at: Some(now),
            },
        );
        let lease = locks.try_acquire(kind).await.unwrap().unwrap();
        lease.release().await.unwrap();

        store.put_lock(
            kind,
            LockRecord {
                key: kind.lock_key().into(),
                owner: Some("srv:stuck".into()),
                expires_at: RecordedTime::At(now + Duration::seconds(20)),
                updated_at: RecordedTime::At(now - Duration::minutes(5)),
                created_at: Some(now),
            },
        );
        assert!(locks.try_acquire(kind).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_detects_takeover() {
        let store = Arc::new(MemoryLedgerStore::new());
        let locks = manager(store.clone(), LockPolicy::default());
        let kind = LedgerKind::Settlement;

        let lease = locks.try_acquire(kind).await.unwrap().unwrap();
        assert!(lease.renew().await.unwrap());

        let now = Utc::now();
        store.put_lock(
            kind,
            LockRecord {
                key: kind.lock_key().into(),
                owner: Some("srv:other".into()),
                expires_at: RecordedTime::At(now + Duration::seconds(30)),
                updated_at: RecordedTime::At(now),
                created_at: Some(now),
            },
        );
        assert!(!lease.renew().await.unwrap());
        assert!(lease.is_lost());

        // Release must not delete the new owner's lock
        lease.release().await.unwrap();
        let info = locks.lock_info(kind).await.unwrap().unwrap();
        assert_eq!(info.owner.as_deref(), Some("srv:other"));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_expiry() {
        let store = Arc::new(MemoryLedgerStore::new());
        let policy = LockPolicy::from_config(&LockConfig {
            ttl_ms: 1_000,
            ..LockConfig::default()
        });
        let locks = manager(store.clone(), policy);
        let kind = LedgerKind::Settlement;

        let lease = locks.try_acquire(kind).await.unwrap().unwrap();
        let first = store.get_lock(kind, kind.lock_key()).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(800)).await;
        let renewed = store.get_lock(kind, kind.lock_key()).await.unwrap().unwrap();
        assert!(renewed.updated_at.at() > first.updated_at.at());
        assert!(renewed.expires_at.at() > first.expires_at.at());
        assert!(!lease.is_lost());

        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_unlock_validation_and_modes() {
        let store = Arc::new(MemoryLedgerStore::new());
        let locks = manager(store.clone(), LockPolicy::default());
        let kind = LedgerKind::Settlement;

        let both = UnlockRequest {
            key: Some("k".into()),
            all: true,
            ..Default::default()
        };
        assert!(matches!(locks.admin_unlock(kind, &both).await, Err(Error::Validation(_))));
        assert!(matches!(
            locks.admin_unlock(kind, &UnlockRequest::default()).await,
            Err(Error::Validation(_))
        ));
        let bad_age = UnlockRequest {
            all: true,
            max_age_ms: Some(10),
            ..Default::default()
        };
        assert!(matches!(locks.admin_unlock(kind, &bad_age).await, Err(Error::Validation(_))));

        let now = Utc::now();
        for (key, age) in [("old", 10), ("fresh", 0)] {
            store.put_lock(
                kind,
                LockRecord {
                    key: key.into(),
                    owner: Some("srv:x".into()),
                    expires_at: RecordedTime::At(now),
                    updated_at: RecordedTime::At(now - Duration::minutes(age)),
                    created_at: Some(now),
                },
            );
        }
        let stale = UnlockRequest {
            all: true,
            stale_only: true,
            max_age_ms: Some(60_000),
            ..Default::default()
        };
        let outcome = locks.admin_unlock(kind, &stale).await.unwrap();
        assert_eq!(outcome.mode, UnlockMode::AllStale);
        assert_eq!(outcome.keys, vec!["old".to_string()]);

        let one = UnlockRequest {
            key: Some("fresh".into()),
            ..Default::default()
        };
        let outcome = locks.admin_unlock(kind, &one).await.unwrap();
        assert_eq!(outcome.mode, UnlockMode::One);
        assert_eq!(outcome.deleted, 1);
        assert!(locks.list_locks(kind).await.unwrap().is_empty());
    }
}
