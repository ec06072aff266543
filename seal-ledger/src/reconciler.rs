//! Pointer reconciler
//!
//! Trade fills share a `reference_id` with the wallet transaction that
//! settled them. Once the wallet transaction is sealed, its ledger pointer
//! columns are copied onto the trade fill so either row leads to the same
//! block. Which pointer columns exist differs between deployments, so the
//! schema is probed once and turned into a [`PointerMapping`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::SourceStore;
use crate::types::Source;

/// Rows shown when reporting unpointed wallet transactions
const MISSING_SAMPLE: usize = 3;

/// Meaning of a pointer column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointerRole {
    /// Block height
    BlockHeight,
    /// Block hash
    BlockHash,
    /// Leaf hash of the item
    ItemHash,
    /// Index of the item in its block
    ItemIndex,
    /// Document id of the item
    ItemId,
    /// Block commit key
    CommitKey,
    /// Seal time
    CommittedAt,
}

/// SQL type family of a pointer column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// BIGINT / INT
    Integer,
    /// TEXT / VARCHAR
    Text,
    /// TIMESTAMPTZ
    Timestamp,
}

impl PointerRole {
    /// Every role, in mapping order
    pub const ALL: [PointerRole; 7] = [
        PointerRole::BlockHeight,
        PointerRole::BlockHash,
        PointerRole::ItemHash,
        PointerRole::ItemIndex,
        PointerRole::ItemId,
        PointerRole::CommitKey,
        PointerRole::CommittedAt,
    ];

    /// Column names probed for this role, first match wins
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            PointerRole::BlockHeight => &["ledger_block_height"],
            PointerRole::BlockHash => &["ledger_block_hash"],
            PointerRole::ItemHash => &["ledger_item_hash", "ledger_leaf_hash"],
            PointerRole::ItemIndex => &["ledger_item_idx", "ledger_item_index"],
            PointerRole::ItemId => &["ledger_item_id"],
            PointerRole::CommitKey => &["ledger_commit_key"],
            PointerRole::CommittedAt => &["ledger_committed_at"],
        }
    }

    /// Value family of the role
    pub fn kind(&self) -> ValueKind {
        match self {
            PointerRole::BlockHeight | PointerRole::ItemIndex => ValueKind::Integer,
            PointerRole::CommittedAt => ValueKind::Timestamp,
            _ => ValueKind::Text,
        }
    }

    /// Roles that identify the row's item inside its block
    fn identifies_item(&self) -> bool {
        matches!(
            self,
            PointerRole::ItemIndex
                | PointerRole::ItemHash
                | PointerRole::ItemId
                | PointerRole::CommitKey
        )
    }
}

/// A pointer value read from a source row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerValue {
    /// Integer column
    Integer(i64),
    /// Text column
    Text(String),
    /// Timestamp column
    Timestamp(DateTime<Utc>),
}

/// Pointer columns present on each side of the join
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerSchema {
    /// Columns of `wallet_transactions`
    pub origin: BTreeMap<PointerRole, String>,
    /// Columns of `trade_fills`
    pub destination: BTreeMap<PointerRole, String>,
}

fn pick(columns: &BTreeSet<String>, role: PointerRole) -> Option<String> {
    role.candidates()
        .iter()
        .find(|name| columns.contains(**name))
        .map(|name| name.to_string())
}

impl PointerSchema {
    /// Resolve roles against the column sets of both tables
    pub fn resolve(origin_columns: &BTreeSet<String>, destination_columns: &BTreeSet<String>) -> Self {
        let mut schema = PointerSchema::default();
        for role in PointerRole::ALL {
            if let Some(column) = pick(origin_columns, role) {
                schema.origin.insert(role, column);
            }
            if let Some(column) = pick(destination_columns, role) {
                schema.destination.insert(role, column);
            }
        }
        schema
    }
}

/// A role mapped on both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPair {
    /// Role
    pub role: PointerRole,
    /// Column on `wallet_transactions`
    pub origin: String,
    /// Column on `trade_fills`
    pub destination: String,
}

/// Columns the reconciler copies, in [`PointerRole::ALL`] order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerMapping {
    /// Height and at least one item-identifying role are mapped
    pub enabled: bool,
    /// Mapped roles
    pub pairs: Vec<ColumnPair>,
}

impl PointerMapping {
    /// Mapping of the roles both tables carry
    pub fn from_schema(schema: &PointerSchema) -> Self {
        let pairs: Vec<ColumnPair> = PointerRole::ALL
            .iter()
            .filter_map(|role| {
                let origin = schema.origin.get(role)?;
                let destination = schema.destination.get(role)?;
                Some(ColumnPair {
                    role: *role,
                    origin: origin.clone(),
                    destination: destination.clone(),
                })
            })
            .collect();
        let has_height = pairs.iter().any(|p| p.role == PointerRole::BlockHeight);
        let has_item = pairs.iter().any(|p| p.role.identifies_item());
        Self {
            enabled: has_height && has_item,
            pairs,
        }
    }

    /// Pair of a role
    pub fn pair(&self, role: PointerRole) -> Option<&ColumnPair> {
        self.pairs.iter().find(|p| p.role == role)
    }
}

/// A trade fill that can take its wallet transaction's pointers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelinkCandidate {
    /// `trade_fills.id`
    pub destination_id: i64,
    /// `wallet_transactions.id`
    pub origin_id: i64,
    /// Origin values, parallel to [`PointerMapping::pairs`]
    pub values: Vec<Option<PointerValue>>,
}

/// Result of one reconciler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Trade fills updated
    pub relinked: u64,
    /// Confirmed wallet transactions without pointers
    pub missing_wallet: u64,
    /// Schema lacks the required columns
    pub disabled: bool,
}

/// Copies wallet transaction pointers onto their trade fills
#[derive(Debug)]
pub struct Reconciler {
    sources: Arc<dyn SourceStore>,
    metrics: Arc<Metrics>,
    mapping: OnceCell<PointerMapping>,
    warned_disabled: AtomicBool,
}

impl Reconciler {
    /// Create a reconciler over the relational store
    pub fn new(sources: Arc<dyn SourceStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            sources,
            metrics,
            mapping: OnceCell::new(),
            warned_disabled: AtomicBool::new(false),
        }
    }

    /// Mapping resolved from the live schema, probed on first use
    pub async fn mapping(&self) -> Result<&PointerMapping> {
        self.mapping
            .get_or_try_init(|| async {
                let origin = self
                    .sources
                    .table_columns(Source::WalletTransactions.as_str())
                    .await?;
                let destination = self
                    .sources
                    .table_columns(Source::TradeFills.as_str())
                    .await?;
                let schema = PointerSchema::resolve(&origin, &destination);
                Ok::<_, Error>(PointerMapping::from_schema(&schema))
            })
            .await
    }

    /// Relink up to `batch_size` trade fills and report unpointed wallet rows
    pub async fn run_once(&self, batch_size: usize) -> Result<ReconcileReport> {
        let mapping = self.mapping().await?;
        if !mapping.enabled {
            if !self.warned_disabled.swap(true, Ordering::SeqCst) {
                let mapped: Vec<&str> = mapping.pairs.iter().map(|p| p.origin.as_str()).collect();
                warn!(
                    mapped = ?mapped,
                    "reconcile_job_disabled_missing_required_pointer_columns"
                );
            }
            return Ok(ReconcileReport {
                relinked: 0,
                missing_wallet: 0,
                disabled: true,
            });
        }

        let candidates = self
            .sources
            .relink_candidates(mapping, batch_size.max(1))
            .await?;
        let mut relinked = 0u64;
        for candidate in &candidates {
            relinked += self.sources.apply_relink(mapping, candidate).await?;
        }
        if relinked > 0 {
            self.metrics.record_relinked(relinked);
        }

        let missing = self
            .sources
            .missing_wallet_pointers(mapping, MISSING_SAMPLE)
            .await?;
        if missing.total > 0 {
            warn!(
                count = missing.total,
                sample = ?missing.sample,
                "reconcile_wallet_missing_ledger_pointers"
            );
        }

        if relinked > 0 || missing.total > 0 {
            info!(
                candidates = candidates.len(),
                relinked,
                missing_wallet = missing.total,
                "reconcile_job_tick"
            );
        } else {
            debug!(candidates = candidates.len(), "reconcile_job_tick");
        }

        Ok(ReconcileReport {
            relinked,
            missing_wallet: missing.total,
            disabled: false,
        })
    }
}
