//! Admin facade over both ledgers
//!
//! This module wires the stores, the sealer, the verifier, the lock manager,
//! the receipt builder and the reconciler into one handle.
//!
//! # Example
//!
//! ```no_run
//! use seal_ledger::{CommitRequest, Config, Ledger, LedgerKind};
//!
//! #[tokio::main]
//! async fn main() -> seal_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::from_env()?).await?;
//!
//!     let outcome = ledger
//!         .commit_next_block(LedgerKind::Settlement, &CommitRequest::new("admin-1", 500))
//!         .await?;
//!     println!("{}", serde_json::to_string(&outcome)?);
//!
//!     Ok(())
//! }
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::{
    actions::ActionLog,
    lock::{LockInfo, LockManager, LockPolicy, UnlockOutcome, UnlockRequest},
    metrics::Metrics,
    receipt::{Receipt, ReceiptBuilder, Requester},
    reconciler::{ReconcileReport, Reconciler},
    sealer::{CommitOutcome, CommitRequest, Sealer},
    store::{LedgerStore, PgSourceStore, RocksLedgerStore, SourceStore},
    types::{check_page_limit, AdminAction, Block, Item, LedgerKind, Page, RequestMeta, Source},
    verify::{ChainReport, ChainVerifier, FinalizeOutcome},
    Config, Error, Result,
};

/// Block with its items when requested
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockView {
    /// Block header document
    pub block: Block,
    /// Items ordered by index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Item>>,
}

/// Lock documents of one ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockList {
    /// Number of documents
    pub count: usize,
    /// Documents ordered by key
    pub locks: Vec<LockInfo>,
}

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    /// Document store
    store: Arc<dyn LedgerStore>,

    sealer: Sealer,
    verifier: ChainVerifier,
    locks: LockManager,
    actions: ActionLog,
    receipts: ReceiptBuilder,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open the RocksDB document store and connect to PostgreSQL
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(RocksLedgerStore::open(&config.storage)?);
        let sources = Arc::new(PgSourceStore::connect(&config.database).await?);
        info!(
            service = %config.service_name,
            data_dir = %config.storage.data_dir.display(),
            "ledger_opened"
        );
        Self::new(store, sources, config)
    }

    /// Build a ledger over existing stores
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sources: Arc<dyn SourceStore>,
        config: Config,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let locks = LockManager::new(
            store.clone(),
            LockPolicy::from_config(&config.lock),
            metrics.clone(),
        );
        Ok(Self {
            sealer: Sealer::new(store.clone(), sources.clone(), locks.clone(), metrics.clone()),
            verifier: ChainVerifier::new(store.clone(), metrics.clone()),
            actions: ActionLog::new(store.clone()),
            receipts: ReceiptBuilder::new(store.clone(), sources.clone()),
            reconciler: Arc::new(Reconciler::new(sources, metrics.clone())),
            locks,
            metrics,
            store,
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics registry
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Seal the next block
    pub async fn commit_next_block(
        &self,
        kind: LedgerKind,
        request: &CommitRequest,
    ) -> Result<CommitOutcome> {
        self.sealer.commit_next_block(kind, request).await
    }

    /// Verify the first `max_blocks` blocks
    pub async fn verify_chain(&self, kind: LedgerKind, max_blocks: usize) -> Result<ChainReport> {
        self.verifier.verify_chain(kind, max_blocks).await
    }

    /// Blocks by height, newest first
    pub async fn list_blocks(&self, kind: LedgerKind, limit: usize, offset: usize) -> Result<Page<Block>> {
        check_page_limit(limit)?;
        let total = self.store.count_blocks(kind).await?;
        let items = self.store.blocks_descending(kind, limit, offset).await?;
        Ok(Page { total, items })
    }

    /// One block, optionally with its items
    pub async fn get_block_by_height(
        &self,
        kind: LedgerKind,
        height: u64,
        include_items: bool,
    ) -> Result<BlockView> {
        if height < 1 {
            return Err(Error::Validation("Invalid height".into()));
        }
        let block = self
            .store
            .block_by_height(kind, height)
            .await?
            .ok_or_else(|| Error::NotFound("Block not found".into()))?;
        let items = if include_items {
            Some(self.store.block_items(kind, block.block_id).await?)
        } else {
            None
        };
        Ok(BlockView { block, items })
    }

    /// Lock documents
    pub async fn list_locks(&self, kind: LedgerKind) -> Result<LockList> {
        let locks = self.locks.list_locks(kind).await?;
        Ok(LockList {
            count: locks.len(),
            locks,
        })
    }

    /// Forcibly remove lock documents
    pub async fn admin_unlock(&self, kind: LedgerKind, request: &UnlockRequest) -> Result<UnlockOutcome> {
        self.locks.admin_unlock(kind, request).await
    }

    /// Re-verify one block and mark it FINALIZED
    pub async fn finalize_block(
        &self,
        kind: LedgerKind,
        height: u64,
        finalized_by: &str,
        meta: &RequestMeta,
    ) -> Result<FinalizeOutcome> {
        self.verifier
            .finalize_block(kind, height, finalized_by, meta)
            .await
    }

    /// Admin actions, newest first
    pub async fn list_admin_actions(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Page<AdminAction>> {
        self.actions.list(kind, limit, offset).await
    }

    /// Inclusion receipt of a source row; the ledger follows from `source`
    pub async fn get_receipt(&self, source: Source, row_id: i64, requester: &Requester) -> Result<Receipt> {
        self.receipts.get_receipt(source, row_id, requester).await
    }

    /// One reconciler pass
    pub async fn reconcile_once(&self, batch_size: usize) -> Result<ReconcileReport> {
        self.reconciler.run_once(batch_size).await
    }
}
