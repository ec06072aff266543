//! In-memory store backends
//!
//! Used by tests and for embedding. Each backend keeps its state behind one
//! `parking_lot::Mutex`, which makes every conditional write atomic. Locks
//! are never held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{is_restartable, ActionOutcome, LedgerStore, LockFilter, MissingPointers, SourceStore};
use crate::error::{Error, Result};
use crate::reconciler::{PointerMapping, PointerValue, RelinkCandidate};
use crate::types::{
    ActionStatus, AdminAction, BackPointer, Block, BlockStatus, Cursor, Item, LedgerKind,
    LockClaim, LockRecord, PointedRow, RequestMeta, RowPointers, Source, SourceRow,
};

#[derive(Debug, Default)]
struct LedgerState {
    blocks: BTreeMap<u64, Block>,
    items: BTreeMap<(Uuid, u32), Item>,
    cursors: BTreeMap<Source, Cursor>,
    locks: BTreeMap<String, LockRecord>,
    actions: BTreeMap<String, AdminAction>,
}

/// Document store held in process memory
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<HashMap<LedgerKind, LedgerState>>,
    fail_items_insert: AtomicBool,
    fail_cursor_write: AtomicBool,
    fail_cursor_write_of: Mutex<Option<Source>>,
}

impl MemoryLedgerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, kind: LedgerKind, f: impl FnOnce(&mut LedgerState) -> T) -> T {
        let mut state = self.state.lock();
        f(state.entry(kind).or_default())
    }

    /// Make the next `insert_items` call fail
    pub fn fail_next_items_insert(&self) {
        self.fail_items_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next `set_cursor` call fail
    pub fn fail_next_cursor_write(&self) {
        self.fail_cursor_write.store(true, Ordering::SeqCst);
    }

    /// Make the next `set_cursor` call for `source` fail
    pub fn fail_next_cursor_write_of(&self, source: Source) {
        *self.fail_cursor_write_of.lock() = Some(source);
    }

    /// Overwrite a lock document as-is
    pub fn put_lock(&self, kind: LedgerKind, record: LockRecord) {
        self.with(kind, |s| {
            s.locks.insert(record.key.clone(), record);
        });
    }

    /// Edit a stored block in place, bypassing every check
    pub fn tamper_block(&self, kind: LedgerKind, height: u64, f: impl FnOnce(&mut Block)) -> bool {
        self.with(kind, |s| match s.blocks.get_mut(&height) {
            Some(block) => {
                f(block);
                true
            }
            None => false,
        })
    }

    /// Edit a stored item in place, bypassing every check
    pub fn tamper_item(
        &self,
        kind: LedgerKind,
        block_id: Uuid,
        idx: u32,
        f: impl FnOnce(&mut Item),
    ) -> bool {
        self.with(kind, |s| match s.items.get_mut(&(block_id, idx)) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn tip_block(&self, kind: LedgerKind) -> Result<Option<Block>> {
        Ok(self.with(kind, |s| s.blocks.values().next_back().cloned()))
    }

    async fn insert_block(&self, kind: LedgerKind, block: &Block) -> Result<()> {
        self.with(kind, |s| {
            if s.blocks.contains_key(&block.height) {
                return Err(Error::DuplicateKey(format!("height {}", block.height)));
            }
            for existing in s.blocks.values() {
                if existing.block_hash == block.block_hash {
                    return Err(Error::DuplicateKey(format!("blockHash {}", block.block_hash)));
                }
                if existing.commit_key == block.commit_key {
                    return Err(Error::DuplicateKey(format!("commitKey {}", block.commit_key)));
                }
                if existing.block_id == block.block_id {
                    return Err(Error::DuplicateKey(format!("blockId {}", block.block_id)));
                }
            }
            s.blocks.insert(block.height, block.clone());
            Ok(())
        })
    }

    async fn delete_block(&self, kind: LedgerKind, block_id: Uuid) -> Result<()> {
        self.with(kind, |s| s.blocks.retain(|_, b| b.block_id != block_id));
        Ok(())
    }

    async fn block_by_height(&self, kind: LedgerKind, height: u64) -> Result<Option<Block>> {
        Ok(self.with(kind, |s| s.blocks.get(&height).cloned()))
    }

    async fn blocks_ascending(&self, kind: LedgerKind, limit: usize) -> Result<Vec<Block>> {
        Ok(self.with(kind, |s| s.blocks.values().take(limit).cloned().collect()))
    }

    async fn blocks_descending(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Block>> {
        Ok(self.with(kind, |s| {
            s.blocks
                .values()
                .rev()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn count_blocks(&self, kind: LedgerKind) -> Result<u64> {
        Ok(self.with(kind, |s| s.blocks.len() as u64))
    }

    async fn mark_finalized(
        &self,
        kind: LedgerKind,
        height: u64,
        finalized_at: DateTime<Utc>,
        finalized_by: &str,
        meta: &RequestMeta,
    ) -> Result<bool> {
        Ok(self.with(kind, |s| match s.blocks.get_mut(&height) {
            Some(block) if block.status == BlockStatus::Sealed => {
                block.status = BlockStatus::Finalized;
                block.finalized_at = Some(finalized_at);
                block.finalized_by_user_id = Some(finalized_by.to_string());
                block.finalize_meta = Some(meta.clone());
                true
            }
            _ => false,
        }))
    }

    async fn insert_items(&self, kind: LedgerKind, items: &[Item]) -> Result<()> {
        if self.fail_items_insert.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage("injected items insert failure".to_string()));
        }
        self.with(kind, |s| {
            let mut sealed: BTreeSet<(Source, i64)> =
                s.items.values().map(|i| (i.source, i.source_id)).collect();
            for item in items {
                if s.items.contains_key(&(item.block_id, item.idx)) {
                    return Err(Error::DuplicateKey(format!(
                        "item {}#{}",
                        item.block_id, item.idx
                    )));
                }
                if !sealed.insert((item.source, item.source_id)) {
                    return Err(Error::DuplicateKey(format!(
                        "{}#{} already sealed",
                        item.source, item.source_id
                    )));
                }
            }
            for item in items {
                s.items.insert((item.block_id, item.idx), item.clone());
            }
            Ok(())
        })
    }

    async fn delete_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<u64> {
        Ok(self.with(kind, |s| {
            let before = s.items.len();
            s.items.retain(|(id, _), _| *id != block_id);
            (before - s.items.len()) as u64
        }))
    }

    async fn block_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<Vec<Item>> {
        Ok(self.with(kind, |s| {
            s.items
                .range((block_id, 0)..=(block_id, u32::MAX))
                .map(|(_, item)| item.clone())
                .collect()
        }))
    }

    async fn item_at(&self, kind: LedgerKind, block_id: Uuid, idx: u32) -> Result<Option<Item>> {
        Ok(self.with(kind, |s| s.items.get(&(block_id, idx)).cloned()))
    }

    async fn cursor(&self, kind: LedgerKind, source: Source) -> Result<Option<Cursor>> {
        Ok(self.with(kind, |s| s.cursors.get(&source).cloned()))
    }

    async fn set_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        last_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let targeted = {
            let mut target = self.fail_cursor_write_of.lock();
            if *target == Some(source) {
                target.take().is_some()
            } else {
                false
            }
        };
        if targeted || self.fail_cursor_write.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage("injected cursor write failure".to_string()));
        }
        self.with(kind, |s| {
            s.cursors.insert(
                source,
                Cursor {
                    source,
                    last_id,
                    updated_at: at,
                },
            );
        });
        Ok(())
    }

    async fn restore_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        written: i64,
        previous: Option<&Cursor>,
    ) -> Result<bool> {
        Ok(self.with(kind, |s| {
            if s.cursors.get(&source).map(|c| c.last_id) != Some(written) {
                return false;
            }
            match previous {
                Some(cursor) => s.cursors.insert(source, cursor.clone()),
                None => s.cursors.remove(&source),
            };
            true
        }))
    }

    async fn claim_lock(&self, kind: LedgerKind, claim: &LockClaim) -> Result<LockRecord> {
        Ok(self.with(kind, |s| {
            let existing = s.locks.get(&claim.key);
            let next = match existing {
                Some(current) if !claim.admits(current) => return current.clone(),
                other => claim.to_record(other),
            };
            s.locks.insert(claim.key.clone(), next.clone());
            next
        }))
    }

    async fn renew_lock(
        &self,
        kind: LedgerKind,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with(kind, |s| match s.locks.get_mut(key) {
            Some(record) if record.owner.as_deref() == Some(owner) => {
                record.expires_at = expires_at.into();
                record.updated_at = now.into();
                true
            }
            _ => false,
        }))
    }

    async fn release_lock(&self, kind: LedgerKind, key: &str, owner: &str) -> Result<bool> {
        Ok(self.with(kind, |s| {
            let held = s
                .locks
                .get(key)
                .map_or(false, |r| r.owner.as_deref() == Some(owner));
            if held {
                s.locks.remove(key);
            }
            held
        }))
    }

    async fn get_lock(&self, kind: LedgerKind, key: &str) -> Result<Option<LockRecord>> {
        Ok(self.with(kind, |s| s.locks.get(key).cloned()))
    }

    async fn list_locks(&self, kind: LedgerKind) -> Result<Vec<LockRecord>> {
        Ok(self.with(kind, |s| s.locks.values().cloned().collect()))
    }

    async fn delete_locks(&self, kind: LedgerKind, filter: &LockFilter) -> Result<Vec<String>> {
        Ok(self.with(kind, |s| {
            let keys: Vec<String> = s
                .locks
                .values()
                .filter(|r| filter.matches(r))
                .map(|r| r.key.clone())
                .collect();
            for key in &keys {
                s.locks.remove(key);
            }
            keys
        }))
    }

    async fn insert_action(&self, kind: LedgerKind, action: &AdminAction) -> Result<()> {
        self.with(kind, |s| {
            if s.actions.contains_key(&action.id) {
                return Err(Error::DuplicateKey(format!("action {}", action.id)));
            }
            s.actions.insert(action.id.clone(), action.clone());
            Ok(())
        })
    }

    async fn begin_keyed_action(
        &self,
        kind: LedgerKind,
        action: &AdminAction,
    ) -> Result<Option<AdminAction>> {
        Ok(self.with(kind, |s| match s.actions.get_mut(&action.id) {
            None => {
                s.actions.insert(action.id.clone(), action.clone());
                None
            }
            Some(existing) if is_restartable(existing) => {
                let previous = existing.clone();
                existing.status = ActionStatus::InProgress;
                existing.meta = action.meta.clone();
                existing.result = None;
                existing.error = None;
                existing.updated_at = action.updated_at;
                Some(previous)
            }
            Some(existing) => Some(existing.clone()),
        }))
    }

    async fn finish_action(
        &self,
        kind: LedgerKind,
        id: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with(kind, |s| {
            let action = s
                .actions
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("Admin action not found: {}", id)))?;
            match outcome {
                ActionOutcome::Success(result) => {
                    action.status = ActionStatus::Success;
                    action.result = Some(result);
                    action.error = None;
                }
                ActionOutcome::Failed(error) => {
                    action.status = ActionStatus::Failed;
                    action.error = Some(error);
                }
            }
            action.updated_at = at;
            Ok(())
        })
    }

    async fn list_actions(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AdminAction>> {
        Ok(self.with(kind, |s| {
            let mut actions: Vec<AdminAction> = s.actions.values().cloned().collect();
            actions.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            actions.into_iter().skip(offset).take(limit).collect()
        }))
    }

    async fn count_actions(&self, kind: LedgerKind) -> Result<u64> {
        Ok(self.with(kind, |s| s.actions.len() as u64))
    }
}

const BACK_POINTER_COLUMNS: [&str; 5] = [
    "ledger_block_height",
    "ledger_block_hash",
    "ledger_commit_key",
    "ledger_item_idx",
    "ledger_committed_at",
];

fn base_columns(source: Source) -> &'static [&'static str] {
    match source {
        Source::WalletTransactions => &[
            "id",
            "user_id",
            "type",
            "amount",
            "balance_after",
            "description",
            "reference_id",
            "status",
            "created_at",
        ],
        Source::TradeFills => &[
            "id",
            "user_id",
            "side",
            "symbol",
            "qty",
            "price",
            "gross_quote",
            "fee_quote",
            "net_quote",
            "wallet_tx_id",
            "reference_id",
            "request_id",
            "status",
            "created_at",
        ],
        Source::SecurityLogs => &[
            "id",
            "user_id",
            "event_type",
            "ip",
            "user_agent",
            "metadata",
            "created_at",
        ],
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: SourceRow,
    pointers: BTreeMap<String, PointerValue>,
}

impl StoredRow {
    fn integer(&self, column: &str) -> Option<i64> {
        match self.pointers.get(column) {
            Some(PointerValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    fn text(&self, column: &str) -> Option<String> {
        match self.pointers.get(column) {
            Some(PointerValue::Text(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        match self.pointers.get(column) {
            Some(PointerValue::Timestamp(v)) => Some(*v),
            _ => None,
        }
    }

    fn reference_id(&self) -> Option<&str> {
        match &self.row {
            SourceRow::Wallet(r) => r.reference_id.as_deref(),
            SourceRow::Trade(r) => r.reference_id.as_deref(),
            SourceRow::Security(_) => None,
        }
    }

    fn status(&self) -> Option<&str> {
        match &self.row {
            SourceRow::Wallet(r) => Some(r.status.as_str()),
            SourceRow::Trade(r) => Some(r.status.as_str()),
            SourceRow::Security(_) => None,
        }
    }
}

#[derive(Debug)]
struct SourceTables {
    rows: HashMap<Source, BTreeMap<i64, StoredRow>>,
    columns: HashMap<Source, BTreeSet<String>>,
}

impl Default for SourceTables {
    fn default() -> Self {
        let columns = [Source::WalletTransactions, Source::TradeFills, Source::SecurityLogs]
            .into_iter()
            .map(|source| {
                let names = base_columns(source)
                    .iter()
                    .chain(BACK_POINTER_COLUMNS.iter())
                    .map(|c| c.to_string())
                    .collect();
                (source, names)
            })
            .collect();
        Self {
            rows: HashMap::new(),
            columns,
        }
    }
}

/// Relational store held in process memory
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    tables: Mutex<SourceTables>,
    fail_pointer_writes: AtomicBool,
}

impl MemorySourceStore {
    /// Create empty tables with the standard columns
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row
    pub fn insert(&self, row: SourceRow) {
        let mut tables = self.tables.lock();
        tables.rows.entry(row.source()).or_default().insert(
            row.id(),
            StoredRow {
                row,
                pointers: BTreeMap::new(),
            },
        );
    }

    /// Edit a row in place (pointer columns untouched)
    pub fn update_row(&self, source: Source, id: i64, f: impl FnOnce(&mut SourceRow)) -> bool {
        let mut tables = self.tables.lock();
        match tables.rows.get_mut(&source).and_then(|t| t.get_mut(&id)) {
            Some(stored) => {
                f(&mut stored.row);
                true
            }
            None => false,
        }
    }

    /// Replace the column set of a table
    pub fn set_columns(&self, source: Source, columns: &[&str]) {
        let mut tables = self.tables.lock();
        tables
            .columns
            .insert(source, columns.iter().map(|c| c.to_string()).collect());
    }

    /// Read one pointer column
    pub fn pointer(&self, source: Source, id: i64, column: &str) -> Option<PointerValue> {
        let tables = self.tables.lock();
        tables
            .rows
            .get(&source)
            .and_then(|t| t.get(&id))
            .and_then(|r| r.pointers.get(column).cloned())
    }

    /// Write one pointer column unconditionally
    pub fn set_pointer(&self, source: Source, id: i64, column: &str, value: Option<PointerValue>) {
        let mut tables = self.tables.lock();
        if let Some(stored) = tables.rows.get_mut(&source).and_then(|t| t.get_mut(&id)) {
            match value {
                Some(v) => stored.pointers.insert(column.to_string(), v),
                None => stored.pointers.remove(column),
            };
        }
    }

    /// Make every `write_back_pointers` call fail until reset
    pub fn fail_pointer_writes(&self, fail: bool) {
        self.fail_pointer_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn fetch_after(
        &self,
        source: Source,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let tables = self.tables.lock();
        Ok(tables
            .rows
            .get(&source)
            .map(|t| {
                t.range(after_id.saturating_add(1)..)
                    .take(limit)
                    .map(|(_, r)| r.row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_back_pointers(
        &self,
        source: Source,
        pointer: &BackPointer,
        rows: &[(i64, u32)],
    ) -> Result<u64> {
        if self.fail_pointer_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected back-pointer failure".to_string()));
        }
        let mut tables = self.tables.lock();
        let columns = tables.columns.get(&source).cloned().unwrap_or_default();
        if let Some(missing) = BACK_POINTER_COLUMNS.iter().find(|c| !columns.contains(**c)) {
            return Err(Error::Configuration(format!(
                "column {} does not exist on {}",
                missing, source
            )));
        }

        let table = tables.rows.entry(source).or_default();
        let mut updated = 0;
        for (id, idx) in rows {
            let Some(stored) = table.get_mut(id) else {
                continue;
            };
            if stored.pointers.contains_key("ledger_block_height") {
                continue;
            }
            let values = [
                ("ledger_block_height", PointerValue::Integer(pointer.height as i64)),
                ("ledger_block_hash", PointerValue::Text(pointer.block_hash.clone())),
                ("ledger_commit_key", PointerValue::Text(pointer.commit_key.clone())),
                ("ledger_item_idx", PointerValue::Integer(i64::from(*idx))),
                ("ledger_committed_at", PointerValue::Timestamp(pointer.committed_at)),
            ];
            for (column, value) in values {
                stored.pointers.insert(column.to_string(), value);
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn find_row(&self, source: Source, id: i64) -> Result<Option<PointedRow>> {
        let tables = self.tables.lock();
        Ok(tables.rows.get(&source).and_then(|t| t.get(&id)).map(|stored| {
            PointedRow {
                row: stored.row.clone(),
                pointers: RowPointers {
                    height: stored
                        .integer("ledger_block_height")
                        .and_then(|v| u64::try_from(v).ok()),
                    block_hash: stored.text("ledger_block_hash"),
                    commit_key: stored.text("ledger_commit_key"),
                    item_idx: stored
                        .integer("ledger_item_idx")
                        .and_then(|v| u32::try_from(v).ok()),
                    committed_at: stored.timestamp("ledger_committed_at"),
                },
            }
        }))
    }

    async fn table_columns(&self, table: &str) -> Result<BTreeSet<String>> {
        let source: Source = table.parse()?;
        let tables = self.tables.lock();
        Ok(tables.columns.get(&source).cloned().unwrap_or_default())
    }

    async fn relink_candidates(
        &self,
        mapping: &PointerMapping,
        limit: usize,
    ) -> Result<Vec<RelinkCandidate>> {
        let Some(height) = mapping.pair(crate::reconciler::PointerRole::BlockHeight) else {
            return Ok(Vec::new());
        };
        let tables = self.tables.lock();
        let empty = BTreeMap::new();
        let fills = tables.rows.get(&Source::TradeFills).unwrap_or(&empty);
        let wallets = tables.rows.get(&Source::WalletTransactions).unwrap_or(&empty);

        let mut out = Vec::new();
        for (fill_id, fill) in fills {
            if out.len() >= limit {
                break;
            }
            if fill.status() == Some("REVERSED") {
                continue;
            }
            let Some(reference) = fill.reference_id() else {
                continue;
            };
            let unset = mapping
                .pairs
                .iter()
                .any(|p| !fill.pointers.contains_key(&p.destination));
            if !unset {
                continue;
            }
            for (wallet_id, wallet) in wallets {
                if out.len() >= limit {
                    break;
                }
                if wallet.reference_id() != Some(reference)
                    || !wallet.pointers.contains_key(&height.origin)
                {
                    continue;
                }
                out.push(RelinkCandidate {
                    destination_id: *fill_id,
                    origin_id: *wallet_id,
                    values: mapping
                        .pairs
                        .iter()
                        .map(|p| wallet.pointers.get(&p.origin).cloned())
                        .collect(),
                });
            }
        }
        Ok(out)
    }

    async fn apply_relink(
        &self,
        mapping: &PointerMapping,
        candidate: &RelinkCandidate,
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let Some(fill) = tables
            .rows
            .get_mut(&Source::TradeFills)
            .and_then(|t| t.get_mut(&candidate.destination_id))
        else {
            return Ok(0);
        };
        let unset = mapping
            .pairs
            .iter()
            .any(|p| !fill.pointers.contains_key(&p.destination));
        if !unset {
            return Ok(0);
        }
        for (pair, value) in mapping.pairs.iter().zip(&candidate.values) {
            if let Some(value) = value {
                fill.pointers
                    .entry(pair.destination.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        Ok(1)
    }

    async fn missing_wallet_pointers(
        &self,
        mapping: &PointerMapping,
        sample: usize,
    ) -> Result<MissingPointers> {
        let tables = self.tables.lock();
        let mut report = MissingPointers::default();
        if let Some(wallets) = tables.rows.get(&Source::WalletTransactions) {
            for (id, wallet) in wallets {
                if wallet.status() != Some("CONFIRMED") {
                    continue;
                }
                if mapping
                    .pairs
                    .iter()
                    .any(|p| !wallet.pointers.contains_key(&p.origin))
                {
                    report.total += 1;
                    if report.sample.len() < sample {
                        report.sample.push(*id);
                    }
                }
            }
        }
        Ok(report)
    }
}
