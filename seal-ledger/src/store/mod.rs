//! Storage ports
//!
//! The ledger talks to two stores:
//!
//! - a document store ([`LedgerStore`]) holding blocks, items, cursors, lock
//!   documents and the admin action log, one set of collections per
//!   [`LedgerKind`];
//! - the relational store ([`SourceStore`]) that owns the source tables and
//!   their back-pointer columns.
//!
//! Conditional writes (lock claims, keyed action starts, finalization) are
//! atomic inside each backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::reconciler::{PointerMapping, RelinkCandidate};
use crate::types::{
    ActionError, ActionStatus, AdminAction, BackPointer, Block, Cursor, Item, LedgerKind,
    LockClaim, LockRecord, PointedRow, RecordedTime, RequestMeta, Source, SourceRow,
};

pub mod memory;
pub mod postgres;
pub mod rocks;

pub use memory::{MemoryLedgerStore, MemorySourceStore};
pub use postgres::PgSourceStore;
pub use rocks::RocksLedgerStore;

/// Which lock documents an admin unlock removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFilter {
    /// One key
    Key(String),
    /// Every lock of the ledger
    All,
    /// Locks last updated at or before the cutoff, or with no usable update time
    UpdatedBefore(DateTime<Utc>),
}

impl LockFilter {
    /// Whether `record` is selected
    pub fn matches(&self, record: &LockRecord) -> bool {
        match self {
            LockFilter::Key(key) => record.key == *key,
            LockFilter::All => true,
            LockFilter::UpdatedBefore(cutoff) => match &record.updated_at {
                RecordedTime::At(ts) => ts <= cutoff,
                RecordedTime::Missing | RecordedTime::Corrupt(_) => true,
            },
        }
    }
}

/// Terminal state of an admin action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// SUCCESS with the stored result
    Success(Value),
    /// FAILED with the error body
    Failed(ActionError),
}

/// Whether a keyed action found in the log may be started again
pub fn is_restartable(existing: &AdminAction) -> bool {
    match existing.status {
        ActionStatus::Failed => true,
        ActionStatus::Success => existing.result.is_none(),
        ActionStatus::InProgress => false,
    }
}

/// Document store port
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Block with the greatest height
    async fn tip_block(&self, kind: LedgerKind) -> Result<Option<Block>>;

    /// Insert a block; `DuplicateKey` if height, hash, commit key or id exist
    async fn insert_block(&self, kind: LedgerKind, block: &Block) -> Result<()>;

    /// Remove a block (seal compensation only)
    async fn delete_block(&self, kind: LedgerKind, block_id: Uuid) -> Result<()>;

    /// Block at `height`
    async fn block_by_height(&self, kind: LedgerKind, height: u64) -> Result<Option<Block>>;

    /// First `limit` blocks by ascending height
    async fn blocks_ascending(&self, kind: LedgerKind, limit: usize) -> Result<Vec<Block>>;

    /// Page of blocks by descending height
    async fn blocks_descending(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Block>>;

    /// Number of blocks
    async fn count_blocks(&self, kind: LedgerKind) -> Result<u64>;

    /// Mark a SEALED block FINALIZED; false if it is missing or already finalized
    async fn mark_finalized(
        &self,
        kind: LedgerKind,
        height: u64,
        finalized_at: DateTime<Utc>,
        finalized_by: &str,
        meta: &RequestMeta,
    ) -> Result<bool>;

    /// Insert all items or none; `DuplicateKey` on `(block, idx)` or `(source, source_id)`
    async fn insert_items(&self, kind: LedgerKind, items: &[Item]) -> Result<()>;

    /// Remove the items of a block (seal compensation only)
    async fn delete_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<u64>;

    /// Items of a block in idx order
    async fn block_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<Vec<Item>>;

    /// Item at `idx` of a block
    async fn item_at(&self, kind: LedgerKind, block_id: Uuid, idx: u32) -> Result<Option<Item>>;

    /// Cursor of a source
    async fn cursor(&self, kind: LedgerKind, source: Source) -> Result<Option<Cursor>>;

    /// Upsert the cursor of a source
    async fn set_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        last_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Put a cursor back to `previous` (or remove it) only while it still
    /// reads `written`; false if another writer moved it since
    async fn restore_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        written: i64,
        previous: Option<&Cursor>,
    ) -> Result<bool>;

    /// Atomically take over the lock if the claim admits the current document.
    /// Returns the document as it stands after the attempt.
    async fn claim_lock(&self, kind: LedgerKind, claim: &LockClaim) -> Result<LockRecord>;

    /// Extend a lock still held by `owner`; false if not held
    async fn renew_lock(
        &self,
        kind: LedgerKind,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a lock still held by `owner`; false if not held
    async fn release_lock(&self, kind: LedgerKind, key: &str, owner: &str) -> Result<bool>;

    /// Lock document by key
    async fn get_lock(&self, kind: LedgerKind, key: &str) -> Result<Option<LockRecord>>;

    /// All lock documents by key
    async fn list_locks(&self, kind: LedgerKind) -> Result<Vec<LockRecord>>;

    /// Delete matching lock documents, returning their keys
    async fn delete_locks(&self, kind: LedgerKind, filter: &LockFilter) -> Result<Vec<String>>;

    /// Insert an unkeyed action
    async fn insert_action(&self, kind: LedgerKind, action: &AdminAction) -> Result<()>;

    /// Atomically start a keyed action.
    ///
    /// Absent: inserts `action`, returns `None`. Restartable (see
    /// [`is_restartable`]): moves it back to IN_PROGRESS keeping `created_at`,
    /// returns the previous document. Otherwise leaves it untouched and
    /// returns it.
    async fn begin_keyed_action(
        &self,
        kind: LedgerKind,
        action: &AdminAction,
    ) -> Result<Option<AdminAction>>;

    /// Record the terminal state of an action
    async fn finish_action(
        &self,
        kind: LedgerKind,
        id: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Page of actions, newest first
    async fn list_actions(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AdminAction>>;

    /// Number of actions
    async fn count_actions(&self, kind: LedgerKind) -> Result<u64>;
}

/// Confirmed wallet transactions still missing a ledger pointer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingPointers {
    /// Number of such rows
    pub total: u64,
    /// Up to the requested number of row ids
    pub sample: Vec<i64>,
}

/// Relational store port
#[async_trait]
pub trait SourceStore: Send + Sync + fmt::Debug {
    /// Rows of `source` with id greater than `after_id`, ascending, at most `limit`
    async fn fetch_after(&self, source: Source, after_id: i64, limit: usize)
        -> Result<Vec<SourceRow>>;

    /// Write back-pointers on rows whose `ledger_block_height` is unset.
    /// `rows` pairs a row id with its item index. Returns rows updated.
    async fn write_back_pointers(
        &self,
        source: Source,
        pointer: &BackPointer,
        rows: &[(i64, u32)],
    ) -> Result<u64>;

    /// One row with its back-pointer columns
    async fn find_row(&self, source: Source, id: i64) -> Result<Option<PointedRow>>;

    /// Column names of a table
    async fn table_columns(&self, table: &str) -> Result<BTreeSet<String>>;

    /// Trade fills with unset destination pointers whose wallet transaction
    /// (same `reference_id`) is sealed; REVERSED fills excluded; ascending id
    async fn relink_candidates(
        &self,
        mapping: &PointerMapping,
        limit: usize,
    ) -> Result<Vec<RelinkCandidate>>;

    /// Copy pointer values onto one trade fill, only into unset columns
    async fn apply_relink(
        &self,
        mapping: &PointerMapping,
        candidate: &RelinkCandidate,
    ) -> Result<u64>;

    /// CONFIRMED wallet transactions with any mapped origin column unset
    async fn missing_wallet_pointers(
        &self,
        mapping: &PointerMapping,
        sample: usize,
    ) -> Result<MissingPointers>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lock(key: &str, updated: RecordedTime) -> LockRecord {
        LockRecord {
            key: key.into(),
            owner: Some("srv:x".into()),
            expires_at: RecordedTime::Missing,
            updated_at: updated,
            created_at: None,
        }
    }

    #[test]
    fn test_lock_filter() {
        let now = Utc::now();
        let old = lock("a", RecordedTime::At(now - Duration::hours(2)));
        let fresh = lock("b", RecordedTime::At(now));
        let junk = lock("c", RecordedTime::Corrupt(Value::Bool(true)));

        let stale = LockFilter::UpdatedBefore(now - Duration::hours(1));
        assert!(stale.matches(&old));
        assert!(!stale.matches(&fresh));
        assert!(stale.matches(&junk));

        assert!(LockFilter::Key("b".into()).matches(&fresh));
        assert!(!LockFilter::Key("b".into()).matches(&old));
        assert!(LockFilter::All.matches(&fresh));
    }
}
