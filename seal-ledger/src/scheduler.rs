//! Periodic background jobs
//!
//! Settlement auto-commit, audit auto-commit and the pointer reconciler each
//! run on their own timer and stop on a shared cancellation token. Every tick
//! seals at most one block.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{AutoCommitConfig, ReconcilerConfig};
use crate::ledger::Ledger;
use crate::sealer::{CommitOutcome, CommitRequest};
use crate::types::{LedgerKind, RequestMeta};

/// Event logged when an auto-commit tick fails
pub fn autocommit_failed_event(kind: LedgerKind) -> &'static str {
    match kind {
        LedgerKind::Settlement => "ledger_autocommit_failed",
        LedgerKind::Audit => "audit_autocommit_failed",
    }
}

/// Request metadata stamped on actions of scheduled seals
pub fn autocommit_meta(kind: LedgerKind, sealed_by: &str) -> RequestMeta {
    let (request_id, user_agent) = match kind {
        LedgerKind::Settlement => ("job:ledger_autocommit", "ledger-autocommit-job"),
        LedgerKind::Audit => ("job:audit_ledger_autocommit", "audit-ledger-autocommit-job"),
    };
    RequestMeta {
        request_id: Some(request_id.to_string()),
        admin_user_id: Some(sealed_by.to_string()),
        user_agent: Some(user_agent.to_string()),
        ..Default::default()
    }
}

/// One auto-commit tick.
///
/// Lock and idempotency conflicts are expected when an admin commit races
/// the job and yield `None` silently; other errors are logged.
pub async fn autocommit_tick(
    ledger: &Ledger,
    kind: LedgerKind,
    job: &AutoCommitConfig,
    sealed_by: &str,
) -> Option<CommitOutcome> {
    let request =
        CommitRequest::new(sealed_by, job.max_items).with_meta(autocommit_meta(kind, sealed_by));
    match ledger.commit_next_block(kind, &request).await {
        Ok(outcome) => {
            if !outcome.summary.committed() {
                debug!(ledger = %kind, "autocommit_nothing_to_seal");
            }
            Some(outcome)
        }
        Err(err) if err.is_conflict() => {
            debug!(ledger = %kind, error = %err, "autocommit_skipped_conflict");
            None
        }
        Err(err) => {
            error!(ledger = %kind, error = %err, "{}", autocommit_failed_event(kind));
            None
        }
    }
}

/// One reconciler tick
pub async fn reconcile_tick(ledger: &Ledger, job: &ReconcilerConfig) {
    if let Err(err) = ledger.reconcile_once(job.batch_size).await {
        error!(error = %err, "reconcile_job_failed");
    }
}

/// Handles of the running jobs
#[derive(Debug)]
pub struct Scheduler {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every enabled job
    pub fn start(ledger: Ledger, stop: CancellationToken) -> Self {
        let config = ledger.config().clone();
        let mut handles = Vec::new();

        for (kind, job) in [
            (LedgerKind::Settlement, config.settlement_job.clone()),
            (LedgerKind::Audit, config.audit_job.clone()),
        ] {
            if !job.enabled {
                info!(ledger = %kind, "autocommit_disabled");
                continue;
            }
            let ledger = ledger.clone();
            let sealed_by = config.system_user_id.clone();
            let period = Duration::from_millis(job.interval_ms);
            handles.push(spawn_periodic(period, stop.clone(), move || {
                let ledger = ledger.clone();
                let job = job.clone();
                let sealed_by = sealed_by.clone();
                async move {
                    autocommit_tick(&ledger, kind, &job, &sealed_by).await;
                }
            }));
            info!(ledger = %kind, interval_ms = period.as_millis() as u64, "autocommit_started");
        }

        if config.reconciler.enabled {
            let job = config.reconciler.clone();
            let period = Duration::from_millis(job.interval_ms);
            let ledger = ledger.clone();
            handles.push(spawn_periodic(period, stop.clone(), move || {
                let ledger = ledger.clone();
                let job = job.clone();
                async move { reconcile_tick(&ledger, &job).await }
            }));
            info!(interval_ms = period.as_millis() as u64, "reconcile_job_started");
        } else {
            info!("reconcile_job_disabled");
        }

        Self { stop, handles }
    }

    /// Number of running jobs
    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop every job and wait for in-flight ticks to finish
    pub async fn shutdown(self) {
        self.stop.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("scheduler_stopped");
    }
}

fn spawn_periodic<F, Fut>(period: Duration, stop: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = timer.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryLedgerStore, MemorySourceStore};
    use crate::types::{LockRecord, RecordedTime, SecurityLogRow, SourceRow};
    use crate::Config;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn security_log(id: i64) -> SourceRow {
        SourceRow::Security(SecurityLogRow {
            id,
            user_id: Some("u1".into()),
            event_type: "LOGIN".into(),
            ip: None,
            user_agent: None,
            metadata: None,
            created_at: Utc::now(),
        })
    }

    fn setup(config: Config) -> (Ledger, Arc<MemoryLedgerStore>, Arc<MemorySourceStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let sources = Arc::new(MemorySourceStore::new());
        let ledger = Ledger::new(store.clone(), sources.clone(), config).unwrap();
        (ledger, store, sources)
    }

    #[tokio::test]
    async fn test_tick_swallows_lock_conflict() {
        let (ledger, store, sources) = setup(Config::default());
        sources.insert(security_log(1));
        let now = Utc::now();
        store.put_lock(
            LedgerKind::Audit,
            LockRecord {
                key: LedgerKind::Audit.lock_key().into(),
                owner: Some("srv:other".into()),
                expires_at: RecordedTime::At(now + ChronoDuration::seconds(30)),
                updated_at: RecordedTime::At(now),
                created_at: Some(now),
            },
        );

        let job = AutoCommitConfig::default();
        assert!(autocommit_tick(&ledger, LedgerKind::Audit, &job, "SYSTEM").await.is_none());

        store
            .release_lock(LedgerKind::Audit, LedgerKind::Audit.lock_key(), "srv:other")
            .await
            .unwrap();
        let outcome = autocommit_tick(&ledger, LedgerKind::Audit, &job, "SYSTEM")
            .await
            .unwrap();
        assert!(outcome.summary.committed());
    }

    #[tokio::test]
    async fn test_scheduler_seals_and_stops() {
        let mut config = Config::default();
        config.settlement_job.enabled = false;
        config.audit_job.interval_ms = 20;
        config.reconciler.enabled = false;
        let (ledger, store, sources) = setup(config);
        sources.insert(security_log(1));
        sources.insert(security_log(2));

        let scheduler = Scheduler::start(ledger.clone(), CancellationToken::new());
        assert_eq!(scheduler.job_count(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown().await;

        let tip = store.tip_block(LedgerKind::Audit).await.unwrap().unwrap();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.items_count, 2);
        assert_eq!(tip.sealed_by_user_id, "SYSTEM");
        assert_eq!(store.count_blocks(LedgerKind::Settlement).await.unwrap(), 0);

        let actions = ledger.list_admin_actions(LedgerKind::Audit, 10, 0).await.unwrap();
        assert!(actions.total >= 1);
        let meta = &actions.items[0].meta;
        assert_eq!(meta.request_id.as_deref(), Some("job:audit_ledger_autocommit"));
        assert_eq!(meta.admin_user_id.as_deref(), Some("SYSTEM"));
        assert_eq!(meta.user_agent.as_deref(), Some("audit-ledger-autocommit-job"));
    }

    #[test]
    fn test_autocommit_meta_per_ledger() {
        let meta = autocommit_meta(LedgerKind::Settlement, "ops");
        assert_eq!(meta.request_id.as_deref(), Some("job:ledger_autocommit"));
        assert_eq!(meta.admin_user_id.as_deref(), Some("ops"));
        assert_eq!(meta.user_agent.as_deref(), Some("ledger-autocommit-job"));
        assert!(meta.ip.is_none() && meta.device_id.is_none());
    }

    #[test]
    fn test_failure_event_names() {
        assert_eq!(autocommit_failed_event(LedgerKind::Settlement), "ledger_autocommit_failed");
        assert_eq!(autocommit_failed_event(LedgerKind::Audit), "audit_autocommit_failed");
    }
}
