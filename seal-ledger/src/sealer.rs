//! Commit pipeline
//!
//! One invocation seals at most one block:
//!
//! 1. idempotency gate through the action log
//! 2. acquire the ledger's commit lock
//! 3. read tip and cursors, fetch new rows per source
//! 4. normalize, order by `(createdAt, source, sourceId)`, cap
//! 5. hash, insert block and items, advance cursors
//! 6. best-effort back-pointers onto the source rows
//!
//! A failure during the writes deletes the partial block and restores the
//! cursors before the error surfaces. The lock is always released.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{ActionLog, ActionStart};
use crate::canonical::{self, genesis_hash, NormalizedItem};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::merkle::merkle_root;
use crate::metrics::Metrics;
use crate::store::{LedgerStore, SourceStore};
use crate::types::{
    BackPointer, Block, BlockStatus, Cursor, Item, LedgerKind, RequestMeta, Source,
    SourceSnapshot, TipRef,
};

/// Upper bound for `max_items`
pub const MAX_ITEMS_LIMIT: usize = 2000;

const MIN_FETCH: usize = 50;

/// Parameters of one commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    /// User credited with the seal
    pub sealed_by_user_id: String,
    /// Most items in the block
    pub max_items: usize,
    /// Replays a finished commit when repeated
    pub idempotency_key: Option<String>,
    /// Request metadata for the action log
    pub meta: RequestMeta,
}

impl CommitRequest {
    /// Unkeyed request without metadata
    pub fn new(sealed_by_user_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            sealed_by_user_id: sealed_by_user_id.into(),
            max_items,
            idempotency_key: None,
            meta: RequestMeta::default(),
        }
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach request metadata
    pub fn with_meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sealed_by_user_id.trim().is_empty() {
            return Err(Error::Validation("sealedByUserId is required".into()));
        }
        if !(1..=MAX_ITEMS_LIMIT).contains(&self.max_items) {
            return Err(Error::Validation(format!(
                "maxItems must be between 1 and {}",
                MAX_ITEMS_LIMIT
            )));
        }
        Ok(())
    }
}

/// Summary of a written block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedBlock {
    /// Always true
    pub committed: bool,
    /// Height
    pub height: u64,
    /// Previous hash
    pub prev_hash: String,
    /// Merkle root
    pub merkle_root: String,
    /// Block hash
    pub block_hash: String,
    /// Commit key
    pub commit_key: String,
    /// Number of items
    pub items_count: usize,
}

/// Nothing new to seal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptySeal {
    /// Always false
    pub committed: bool,
    /// Why nothing was written
    pub reason: String,
    /// Current tip, height 0 and GENESIS for the empty chain
    pub tip: TipRef,
}

/// Result stored in the action log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommitSummary {
    /// A block was written
    Sealed(SealedBlock),
    /// No rows past the cursors
    Empty(EmptySeal),
}

impl CommitSummary {
    /// Whether a block was written
    pub fn committed(&self) -> bool {
        matches!(self, CommitSummary::Sealed(_))
    }
}

/// Result of `commit_next_block`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    /// Block summary or empty marker
    #[serde(flatten)]
    pub summary: CommitSummary,
    /// Action log entry
    pub action_id: String,
    /// Served from the action log
    pub replay: bool,
}

/// Ordering of items inside a block: creation time, then source name, then row id
pub fn seal_order(a: &NormalizedItem, b: &NormalizedItem) -> std::cmp::Ordering {
    a.created_at_iso
        .cmp(&b.created_at_iso)
        .then_with(|| a.source.as_str().cmp(b.source.as_str()))
        .then_with(|| a.source_id.cmp(&b.source_id))
}

struct SealPlan {
    block: Block,
    items: Vec<Item>,
    previous_cursors: Vec<(Source, Option<Cursor>)>,
    advance: BTreeMap<Source, i64>,
}

/// Block producer for both ledgers
#[derive(Debug, Clone)]
pub struct Sealer {
    store: Arc<dyn LedgerStore>,
    sources: Arc<dyn SourceStore>,
    locks: LockManager,
    actions: ActionLog,
    metrics: Arc<Metrics>,
}

impl Sealer {
    /// Create a sealer
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sources: Arc<dyn SourceStore>,
        locks: LockManager,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            actions: ActionLog::new(store.clone()),
            store,
            sources,
            locks,
            metrics,
        }
    }

    /// Seal the next block of `kind`
    pub async fn commit_next_block(
        &self,
        kind: LedgerKind,
        request: &CommitRequest,
    ) -> Result<CommitOutcome> {
        request.validate()?;

        let action_id = match self
            .actions
            .begin(kind, request.idempotency_key.as_deref(), &request.meta)
            .await?
        {
            ActionStart::Replay { action_id, result } => {
                debug!(ledger = %kind, action_id = %action_id, "ledger_commit_replayed");
                return Ok(CommitOutcome {
                    summary: serde_json::from_value(result)?,
                    action_id,
                    replay: true,
                });
            }
            ActionStart::Fresh { action_id } => action_id,
        };

        let lease = match self.locks.try_acquire(kind).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                let holder = self.locks.lock_info(kind).await.ok().flatten();
                let err = Error::conflict_with(
                    kind.commit_in_progress_message(),
                    json!({ "lock": holder, "actionId": action_id }),
                );
                self.record_failure(kind, &action_id, &err).await;
                return Err(err);
            }
            Err(err) => {
                self.record_failure(kind, &action_id, &err).await;
                return Err(err);
            }
        };

        let started = Instant::now();
        let sealed = self.seal(kind, request).await;
        if lease.is_lost() {
            warn!(ledger = %kind, owner = %lease.owner(), "ledger_commit_lock_lost_during_seal");
        }
        if let Err(err) = lease.release().await {
            warn!(ledger = %kind, error = %err, "ledger_lock_release_failed");
        }

        match sealed {
            Ok(summary) => {
                self.metrics
                    .record_seal_duration(kind, started.elapsed().as_secs_f64());
                self.actions
                    .succeed(kind, &action_id, serde_json::to_value(&summary)?)
                    .await?;
                Ok(CommitOutcome {
                    summary,
                    action_id,
                    replay: false,
                })
            }
            Err(err) => {
                self.record_failure(kind, &action_id, &err).await;
                Err(err)
            }
        }
    }

    async fn record_failure(&self, kind: LedgerKind, action_id: &str, err: &Error) {
        if err.is_conflict() {
            self.metrics.record_conflict(kind);
        }
        if let Err(log_err) = self.actions.fail(kind, action_id, err).await {
            warn!(ledger = %kind, action_id, error = %log_err, "ledger_action_update_failed");
        }
    }

    async fn seal(&self, kind: LedgerKind, request: &CommitRequest) -> Result<CommitSummary> {
        let tip = self.store.tip_block(kind).await?;
        let Some(plan) = self.plan(kind, request, tip.as_ref()).await? else {
            let tip = tip.map(|b| b.tip()).unwrap_or_else(|| TipRef {
                height: 0,
                block_hash: genesis_hash(),
            });
            return Ok(CommitSummary::Empty(EmptySeal {
                committed: false,
                reason: "No new rows to commit".into(),
                tip,
            }));
        };

        let mut written = Vec::with_capacity(plan.advance.len());
        if let Err(err) = self.persist(kind, &plan, &mut written).await {
            self.compensate(kind, &plan, &written).await;
            return Err(match err {
                Error::DuplicateKey(what) => {
                    debug!(ledger = %kind, height = plan.block.height, what = %what, "ledger_commit_duplicate");
                    Error::conflict("Ledger commit conflict (try again)")
                }
                other => other,
            });
        }

        self.write_back_pointers(kind, &plan).await;

        let block = &plan.block;
        self.metrics.record_block_sealed(kind, block.items_count);
        info!(
            ledger = %kind,
            height = block.height,
            items = block.items_count,
            block_hash = %block.block_hash,
            sealed_by = %block.sealed_by_user_id,
            "{}",
            kind.committed_event()
        );

        Ok(CommitSummary::Sealed(SealedBlock {
            committed: true,
            height: block.height,
            prev_hash: block.prev_hash.clone(),
            merkle_root: block.merkle_root.clone(),
            block_hash: block.block_hash.clone(),
            commit_key: block.commit_key.clone(),
            items_count: block.items_count,
        }))
    }

    async fn plan(
        &self,
        kind: LedgerKind,
        request: &CommitRequest,
        tip: Option<&Block>,
    ) -> Result<Option<SealPlan>> {
        let height = tip.map_or(1, |b| b.height + 1);
        let prev_hash = tip.map_or_else(genesis_hash, |b| b.block_hash.clone());
        let fetch_limit = request.max_items.clamp(MIN_FETCH, MAX_ITEMS_LIMIT);

        let mut previous_cursors = Vec::with_capacity(kind.sources().len());
        let mut snapshots = BTreeMap::new();
        let mut candidates = Vec::new();
        for &source in kind.sources() {
            let cursor = self.store.cursor(kind, source).await?;
            let after = cursor.as_ref().map_or(0, |c| c.last_id);
            let rows = self.sources.fetch_after(source, after, fetch_limit).await?;
            for row in &rows {
                candidates.push(canonical::normalize(source, row)?);
            }
            snapshots.insert(source, SourceSnapshot { from_id_exclusive: after });
            previous_cursors.push((source, cursor));
        }

        candidates.sort_by(seal_order);
        candidates.truncate(request.max_items);
        if candidates.is_empty() {
            return Ok(None);
        }

        let leaves: Vec<String> = candidates.iter().map(|c| c.payload_hash.clone()).collect();
        let root = merkle_root(&leaves);
        let commit_key = canonical::commit_key(height, &prev_hash, &root);
        let block_hash = canonical::block_hash(
            height,
            &prev_hash,
            &root,
            &commit_key,
            &request.sealed_by_user_id,
        );

        let block = Block {
            block_id: Uuid::new_v4(),
            height,
            prev_hash,
            merkle_root: root,
            commit_key,
            block_hash,
            sealed_by_user_id: request.sealed_by_user_id.clone(),
            items_count: candidates.len(),
            status: BlockStatus::Sealed,
            sources: snapshots,
            created_at: Utc::now(),
            version: 1,
            finalized_at: None,
            finalized_by_user_id: None,
            finalize_meta: None,
        };

        let mut advance: BTreeMap<Source, i64> = BTreeMap::new();
        let mut items = Vec::with_capacity(candidates.len());
        for (idx, c) in candidates.into_iter().enumerate() {
            let last = advance.entry(c.source).or_insert(c.source_id);
            *last = (*last).max(c.source_id);
            items.push(Item {
                block_id: block.block_id,
                block_height: height,
                idx: idx as u32,
                source: c.source,
                source_id: c.source_id,
                created_at: c.created_at,
                payload: c.payload,
                payload_hash: c.payload_hash,
            });
        }

        Ok(Some(SealPlan {
            block,
            items,
            previous_cursors,
            advance,
        }))
    }

    /// Write block, items and cursors; `written` collects the cursors that landed
    async fn persist(&self, kind: LedgerKind, plan: &SealPlan, written: &mut Vec<Source>) -> Result<()> {
        self.store.insert_block(kind, &plan.block).await?;
        self.store.insert_items(kind, &plan.items).await?;
        let now = Utc::now();
        for (&source, &last_id) in &plan.advance {
            self.store.set_cursor(kind, source, last_id, now).await?;
            written.push(source);
        }
        Ok(())
    }

    /// Undo a partial seal. Only cursors written by this seal are rolled
    /// back, and only while they still hold the value it wrote.
    async fn compensate(&self, kind: LedgerKind, plan: &SealPlan, written: &[Source]) {
        let block_id = plan.block.block_id;
        let height = plan.block.height;
        if let Err(err) = self.store.delete_items(kind, block_id).await {
            warn!(ledger = %kind, height, error = %err, "ledger_compensation_items_failed");
        }
        if let Err(err) = self.store.delete_block(kind, block_id).await {
            warn!(ledger = %kind, height, error = %err, "ledger_compensation_block_failed");
        }
        for (source, previous) in &plan.previous_cursors {
            let Some(&last_id) = plan.advance.get(source) else {
                continue;
            };
            if !written.contains(source) {
                continue;
            }
            match self
                .store
                .restore_cursor(kind, *source, last_id, previous.as_ref())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(ledger = %kind, source = %source, last_id, "ledger_compensation_cursor_moved")
                }
                Err(err) => {
                    warn!(ledger = %kind, source = %source, error = %err, "ledger_compensation_cursor_failed")
                }
            }
        }
    }

    async fn write_back_pointers(&self, kind: LedgerKind, plan: &SealPlan) {
        let pointer = BackPointer {
            height: plan.block.height,
            block_hash: plan.block.block_hash.clone(),
            commit_key: plan.block.commit_key.clone(),
            committed_at: plan.block.created_at,
        };
        let mut per_source: BTreeMap<Source, Vec<(i64, u32)>> = BTreeMap::new();
        for item in &plan.items {
            per_source
                .entry(item.source)
                .or_default()
                .push((item.source_id, item.idx));
        }
        for (source, rows) in per_source {
            match self.sources.write_back_pointers(source, &pointer, &rows).await {
                Ok(updated) => {
                    debug!(ledger = %kind, source = %source, height = pointer.height, updated, "ledger_backpointers_written")
                }
                Err(err) => warn!(
                    ledger = %kind,
                    source = %source,
                    height = pointer.height,
                    rows = rows.len(),
                    error = %err,
                    "ledger_backpointer_write_failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockPolicy;
    use crate::store::{MemoryLedgerStore, MemorySourceStore};
    use crate::types::{SourceRow, WalletTransactionRow};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn wallet(id: i64, secs: i64) -> SourceRow {
        SourceRow::Wallet(WalletTransactionRow {
            id,
            user_id: "user-1".into(),
            tx_type: "DEPOSIT".into(),
            amount: Decimal::new(10_000 + id, 2),
            balance_after: Decimal::new(50_000, 2),
            description: None,
            reference_id: Some(format!("ref-{}", id)),
            status: "CONFIRMED".into(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        })
    }

    fn sealer() -> (Sealer, Arc<MemoryLedgerStore>, Arc<MemorySourceStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let sources = Arc::new(MemorySourceStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let locks = LockManager::new(store.clone(), LockPolicy::default(), metrics.clone());
        let sealer = Sealer::new(store.clone(), sources.clone(), locks, metrics);
        (sealer, store, sources)
    }

    #[test]
    fn test_request_validation() {
        assert!(CommitRequest::new("admin", 0).validate().is_err());
        assert!(CommitRequest::new("admin", 2001).validate().is_err());
        assert!(CommitRequest::new(" ", 10).validate().is_err());
        assert!(CommitRequest::new("admin", 2000).validate().is_ok());
    }

    #[test]
    fn test_summary_roundtrips_untagged() {
        let empty = CommitSummary::Empty(EmptySeal {
            committed: false,
            reason: "No new rows to commit".into(),
            tip: TipRef {
                height: 0,
                block_hash: genesis_hash(),
            },
        });
        let value = serde_json::to_value(&empty).unwrap();
        assert_eq!(value["committed"], false);
        let back: CommitSummary = serde_json::from_value(value).unwrap();
        assert_eq!(back, empty);
    }

    #[tokio::test]
    async fn test_first_block_links_to_genesis() {
        let (sealer, store, sources) = sealer();
        for id in 1..=3 {
            sources.insert(wallet(id, id));
        }

        let out = sealer
            .commit_next_block(LedgerKind::Settlement, &CommitRequest::new("admin-1", 100))
            .await
            .unwrap();
        let CommitSummary::Sealed(block) = &out.summary else {
            panic!("expected a sealed block");
        };
        assert_eq!(block.height, 1);
        assert_eq!(block.items_count, 3);
        assert_eq!(block.prev_hash, genesis_hash());
        assert!(!out.replay);

        let cursor = store
            .cursor(LedgerKind::Settlement, Source::WalletTransactions)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_id, 3);

        let again = sealer
            .commit_next_block(LedgerKind::Settlement, &CommitRequest::new("admin-1", 100))
            .await
            .unwrap();
        assert!(!again.summary.committed());
    }

    #[tokio::test]
    async fn test_cap_leaves_rest_for_next_block() {
        let (sealer, store, sources) = sealer();
        for id in 1..=5 {
            sources.insert(wallet(id, id));
        }
        sealer
            .commit_next_block(LedgerKind::Settlement, &CommitRequest::new("admin", 2))
            .await
            .unwrap();
        let cursor = store
            .cursor(LedgerKind::Settlement, Source::WalletTransactions)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_id, 2);

        let out = sealer
            .commit_next_block(LedgerKind::Settlement, &CommitRequest::new("admin", 10))
            .await
            .unwrap();
        match out.summary {
            CommitSummary::Sealed(b) => {
                assert_eq!(b.height, 2);
                assert_eq!(b.items_count, 3);
            }
            other => panic!("expected block, got {:?}", other),
        }
    }
}
