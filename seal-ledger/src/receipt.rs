//! Inclusion receipts for sealed source rows
//!
//! A receipt ties one relational row to its block: header, leaf, Merkle path
//! and a fresh verification of that path. The leaf is also recomputed from
//! the row as it stands now, so a row edited after sealing shows up as
//! `payloadHashMatches: false` while the proof itself stays valid.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::canonical::{self, iso_millis};
use crate::error::{Error, Result};
use crate::merkle::{build_proof, verify_proof, ProofStep};
use crate::store::{LedgerStore, SourceStore};
use crate::types::{BlockStatus, PointedRow, Source};

/// Hash rule used by the Merkle path
pub const PROOF_ALGORITHM: &str = "sha256(concat(left,right))";

/// Who is asking for a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Authenticated user id
    pub user_id: String,
    /// Admins may read every receipt
    pub is_admin: bool,
}

impl Requester {
    /// Regular user
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    /// Administrator
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }

    fn may_read(&self, owner: Option<&str>) -> bool {
        self.is_admin || owner.map_or(false, |o| o == self.user_id)
    }
}

/// Where the row sits in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPointers {
    /// Block height
    pub height: u64,
    /// Item index
    pub idx: u32,
    /// Block hash
    pub block_hash: String,
    /// Commit key
    pub commit_key: String,
    /// Seal time recorded on the row
    pub committed_at: Option<String>,
}

/// Block header as shown in a receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptHeader {
    /// Height
    pub height: u64,
    /// Previous hash
    pub prev_hash: String,
    /// Merkle root
    pub merkle_root: String,
    /// Commit key
    pub commit_key: String,
    /// Block hash
    pub block_hash: String,
    /// SEALED or FINALIZED
    pub status: BlockStatus,
    /// Sealer
    pub sealed_by_user_id: String,
    /// Seal time
    pub created_at: String,
    /// Finalization time
    pub finalized_at: Option<String>,
}

/// The proven leaf
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLeaf {
    /// Item index
    pub leaf_index: usize,
    /// Stored leaf hash
    pub leaf_hash: String,
    /// The row's current data still hashes to the stored leaf
    pub payload_hash_matches: bool,
    /// Payload as sealed
    pub payload_from_ledger: Value,
}

/// Merkle path of the leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptProof {
    /// Pair hashing rule
    pub algorithm: &'static str,
    /// Sibling hashes, leaf level first
    pub steps: Vec<ProofStep>,
}

/// Verification computed while building the receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptVerification {
    /// Path folds to the block's Merkle root
    pub proof_ok: bool,
}

/// Inclusion receipt of one row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Source table
    pub source: Source,
    /// Row id
    pub source_id: i64,
    /// Location
    pub pointers: ReceiptPointers,
    /// Block header
    pub block_header: ReceiptHeader,
    /// Leaf
    pub leaf: ReceiptLeaf,
    /// Path
    pub merkle_proof: ReceiptProof,
    /// Result
    pub verification: ReceiptVerification,
}

fn row_label(source: Source) -> (&'static str, &'static str) {
    match source {
        Source::WalletTransactions => ("Wallet transaction", "txId"),
        Source::TradeFills => ("Trade", "tradeId"),
        Source::SecurityLogs => ("Security log", "logId"),
    }
}

/// Builds receipts from both stores
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    store: Arc<dyn LedgerStore>,
    sources: Arc<dyn SourceStore>,
}

impl ReceiptBuilder {
    /// Create a builder
    pub fn new(store: Arc<dyn LedgerStore>, sources: Arc<dyn SourceStore>) -> Self {
        Self { store, sources }
    }

    /// Receipt for row `row_id` of `source`
    pub async fn get_receipt(
        &self,
        source: Source,
        row_id: i64,
        requester: &Requester,
    ) -> Result<Receipt> {
        let (label, id_key) = row_label(source);
        if row_id < 1 {
            return Err(Error::Validation(format!("Invalid {}", id_key)));
        }

        let PointedRow { row, pointers } = self
            .sources
            .find_row(source, row_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} not found", label)))?;

        if !requester.may_read(row.user_id()) {
            debug!(source = %source, row_id, requester = %requester.user_id, "ledger_receipt_forbidden");
            return Err(Error::Forbidden("Forbidden".into()));
        }

        let (Some(height), Some(idx)) = (pointers.height, pointers.item_idx) else {
            return Err(Error::conflict_with(
                format!("{} not yet committed to ledger", label),
                json!({ id_key: row_id }),
            ));
        };

        let kind = source.ledger();
        let block = self
            .store
            .block_by_height(kind, height)
            .await?
            .ok_or_else(|| Error::NotFound("Block not found for receipt".into()))?;

        if let Some(hash) = &pointers.block_hash {
            if *hash != block.block_hash {
                return Err(Error::integrity(
                    height,
                    "blockHash",
                    "Ledger pointer mismatch (blockHash)",
                ));
            }
        }
        if let Some(key) = &pointers.commit_key {
            if *key != block.commit_key {
                return Err(Error::integrity(
                    height,
                    "commitKey",
                    "Ledger pointer mismatch (commitKey)",
                ));
            }
        }

        let item = self
            .store
            .item_at(kind, block.block_id, idx)
            .await?
            .ok_or_else(|| Error::NotFound("Ledger item not found for receipt".into()))?;
        if item.source != source || item.source_id != row_id {
            return Err(Error::integrity(
                height,
                "sourceId",
                format!(
                    "Ledger item mismatch (source/sourceId): expected {}#{}, got {}#{}",
                    source, row_id, item.source, item.source_id
                ),
            ));
        }

        let items = self.store.block_items(kind, block.block_id).await?;
        let leaves: Vec<String> = items.into_iter().map(|i| i.payload_hash).collect();
        let proof = build_proof(&leaves, idx as usize)?;
        let expected = canonical::normalize(source, &row)?;
        let payload_hash_matches = expected.payload_hash == item.payload_hash;
        if !payload_hash_matches {
            warn!(source = %source, row_id, height, idx, "ledger_receipt_payload_drift");
        }
        let proof_ok = verify_proof(&proof.leaf_hash, &proof.steps, &block.merkle_root);

        Ok(Receipt {
            source,
            source_id: row_id,
            pointers: ReceiptPointers {
                height,
                idx,
                block_hash: block.block_hash.clone(),
                commit_key: block.commit_key.clone(),
                committed_at: pointers.committed_at.as_ref().map(iso_millis),
            },
            block_header: ReceiptHeader {
                height: block.height,
                prev_hash: block.prev_hash.clone(),
                merkle_root: block.merkle_root.clone(),
                commit_key: block.commit_key.clone(),
                block_hash: block.block_hash.clone(),
                status: block.status,
                sealed_by_user_id: block.sealed_by_user_id.clone(),
                created_at: iso_millis(&block.created_at),
                finalized_at: block.finalized_at.as_ref().map(iso_millis),
            },
            leaf: ReceiptLeaf {
                leaf_index: proof.leaf_index,
                leaf_hash: proof.leaf_hash,
                payload_hash_matches,
                payload_from_ledger: item.payload,
            },
            merkle_proof: ReceiptProof {
                algorithm: PROOF_ALGORITHM,
                steps: proof.steps,
            },
            verification: ReceiptVerification { proof_ok },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, MemorySourceStore};
    use crate::types::{SecurityLogRow, SourceRow};
    use chrono::Utc;

    fn builder() -> (ReceiptBuilder, Arc<MemorySourceStore>) {
        let sources = Arc::new(MemorySourceStore::new());
        let builder = ReceiptBuilder::new(Arc::new(MemoryLedgerStore::new()), sources.clone());
        (builder, sources)
    }

    fn log(id: i64, user_id: Option<&str>) -> SourceRow {
        SourceRow::Security(SecurityLogRow {
            id,
            user_id: user_id.map(str::to_string),
            event_type: "LOGIN".into(),
            ip: Some("10.0.0.1".into()),
            user_agent: None,
            metadata: None,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_requester_access() {
        assert!(Requester::admin("a").may_read(None));
        assert!(Requester::user("u1").may_read(Some("u1")));
        assert!(!Requester::user("u1").may_read(Some("u2")));
        assert!(!Requester::user("u1").may_read(None));
    }

    #[tokio::test]
    async fn test_rejects_before_touching_ledger() {
        let (builder, sources) = builder();
        sources.insert(log(1, Some("u1")));
        sources.insert(log(2, None));

        let err = builder
            .get_receipt(Source::SecurityLogs, 0, &Requester::admin("a"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);

        let err = builder
            .get_receipt(Source::SecurityLogs, 99, &Requester::admin("a"))
            .await
            .unwrap_err();
        assert_eq!(err.to_body().message, "Security log not found");

        let err = builder
            .get_receipt(Source::SecurityLogs, 2, &Requester::user("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);

        let err = builder
            .get_receipt(Source::SecurityLogs, 1, &Requester::user("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);
        let body = err.to_body();
        assert_eq!(body.message, "Security log not yet committed to ledger");
        assert_eq!(body.details.unwrap()["logId"], 1);
    }
}
