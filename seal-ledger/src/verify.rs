//! Chain verification and block finalization

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::canonical::{self, genesis_hash, iso_millis};
use crate::error::{Error, Result};
use crate::merkle::merkle_root;
use crate::metrics::Metrics;
use crate::store::LedgerStore;
use crate::types::{Block, BlockStatus, LedgerKind, RequestMeta, TipRef};

/// Default number of blocks walked by `verify_chain`
pub const DEFAULT_VERIFY_BLOCKS: usize = 2000;

/// Upper bound for `max_blocks`
pub const MAX_VERIFY_BLOCKS: usize = 5000;

/// Successful chain walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    /// Always true; a broken chain is an error
    pub ok: bool,
    /// Blocks checked
    pub verified: u64,
    /// Last checked block, `None` for an empty chain
    pub tip: Option<TipRef>,
}

/// Result of `finalize_block`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    /// Whether this call flipped the status
    pub finalized: bool,
    /// Height
    pub height: u64,
    /// Block hash
    pub block_hash: String,
    /// Set when `finalized`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<String>,
    /// Set when not `finalized`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Header field whose recomputation disagrees with the stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mismatch {
    MerkleRoot,
    CommitKey,
    BlockHash,
}

impl Mismatch {
    fn field(&self) -> &'static str {
        match self {
            Mismatch::MerkleRoot => "merkleRoot",
            Mismatch::CommitKey => "commitKey",
            Mismatch::BlockHash => "blockHash",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Mismatch::MerkleRoot => "Merkle",
            Mismatch::CommitKey => "CommitKey",
            Mismatch::BlockHash => "BlockHash",
        }
    }
}

/// Recomputes block headers from stored items
#[derive(Debug, Clone)]
pub struct ChainVerifier {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<Metrics>,
}

impl ChainVerifier {
    /// Create a verifier
    pub fn new(store: Arc<dyn LedgerStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Walk blocks from height 1, stopping at the first mismatch
    pub async fn verify_chain(&self, kind: LedgerKind, max_blocks: usize) -> Result<ChainReport> {
        if !(1..=MAX_VERIFY_BLOCKS).contains(&max_blocks) {
            return Err(Error::Validation(format!(
                "maxBlocks must be between 1 and {}",
                MAX_VERIFY_BLOCKS
            )));
        }

        let result = self.walk(kind, max_blocks).await;
        match &result {
            Ok(report) => {
                self.metrics.record_verification(kind, true);
                info!(ledger = %kind, verified = report.verified, "ledger_chain_verified");
            }
            Err(err @ Error::Integrity { height, field, .. }) => {
                self.metrics.record_verification(kind, false);
                warn!(ledger = %kind, height, field = %field, error = %err, "ledger_chain_broken");
            }
            Err(_) => {}
        }
        result
    }

    async fn walk(&self, kind: LedgerKind, max_blocks: usize) -> Result<ChainReport> {
        let blocks = self.store.blocks_ascending(kind, max_blocks).await?;
        let mut expected_prev = genesis_hash();
        for block in &blocks {
            if block.prev_hash != expected_prev {
                return Err(Error::integrity(
                    block.height,
                    "prevHash",
                    format!("Chain broken at height={}: prevHash mismatch", block.height),
                ));
            }
            if let Some(mismatch) = self.recompute(kind, block).await? {
                return Err(Error::integrity(
                    block.height,
                    mismatch.field(),
                    format!("{} mismatch at height={}", mismatch.label(), block.height),
                ));
            }
            expected_prev = block.block_hash.clone();
        }

        Ok(ChainReport {
            ok: true,
            verified: blocks.len() as u64,
            tip: blocks.last().map(Block::tip),
        })
    }

    /// First header field that does not match its recomputation
    async fn recompute(&self, kind: LedgerKind, block: &Block) -> Result<Option<Mismatch>> {
        let items = self.store.block_items(kind, block.block_id).await?;
        let leaves: Vec<String> = items.into_iter().map(|i| i.payload_hash).collect();
        if block.merkle_root != merkle_root(&leaves) {
            return Ok(Some(Mismatch::MerkleRoot));
        }
        let commit_key = canonical::commit_key(block.height, &block.prev_hash, &block.merkle_root);
        if block.commit_key != commit_key {
            return Ok(Some(Mismatch::CommitKey));
        }
        let block_hash = canonical::block_hash(
            block.height,
            &block.prev_hash,
            &block.merkle_root,
            &block.commit_key,
            &block.sealed_by_user_id,
        );
        if block.block_hash != block_hash {
            return Ok(Some(Mismatch::BlockHash));
        }
        Ok(None)
    }

    /// Re-check one block and mark it FINALIZED
    pub async fn finalize_block(
        &self,
        kind: LedgerKind,
        height: u64,
        finalized_by: &str,
        meta: &RequestMeta,
    ) -> Result<FinalizeOutcome> {
        if height < 1 {
            return Err(Error::Validation("Invalid height".into()));
        }
        let block = self
            .store
            .block_by_height(kind, height)
            .await?
            .ok_or_else(|| Error::NotFound("Block not found".into()))?;

        let already = FinalizeOutcome {
            finalized: false,
            height,
            block_hash: block.block_hash.clone(),
            finalized_at: None,
            reason: Some("Already finalized".into()),
        };
        if block.status == BlockStatus::Finalized {
            return Ok(already);
        }

        if let Some(mismatch) = self.recompute(kind, &block).await? {
            return Err(Error::conflict(format!(
                "{} mismatch (cannot finalize)",
                mismatch.label()
            )));
        }

        let now = Utc::now();
        if !self
            .store
            .mark_finalized(kind, height, now, finalized_by, meta)
            .await?
        {
            return Ok(already);
        }
        info!(ledger = %kind, height, finalized_by, "ledger_block_finalized");
        Ok(FinalizeOutcome {
            finalized: true,
            height,
            block_hash: block.block_hash,
            finalized_at: Some(iso_millis(&now)),
            reason: None,
        })
    }
}
