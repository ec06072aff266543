//! Document store on RocksDB
//!
//! # Column Families
//!
//! Per ledger (`ledger_*` for settlement, `audit_*` for audit):
//!
//! - `{blocks}` - Blocks (key: height, big-endian)
//! - `{blocks}_by_hash` - Unique index (key: block hash, value: height)
//! - `{blocks}_by_commit_key` - Unique index (key: commit key, value: height)
//! - `{blocks}_by_id` - Block id lookup (key: block id, value: height)
//! - `{items}` - Items (key: block id || idx)
//! - `{items}_by_source` - Unique index (key: `source:source_id`, value: item key)
//! - `{cursors}` - Cursors (key: source name)
//! - `{locks}` - Lock documents (key: lock key)
//! - `{actions}` - Admin actions (key: action id)
//!
//! Documents are stored as JSON. Check-then-write sequences run under one
//! write guard so unique indexes and conditional updates stay atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{is_restartable, ActionOutcome, LedgerStore, LockFilter};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::types::{
    ActionStatus, AdminAction, Block, BlockStatus, Cursor, Item, LedgerKind, LockClaim,
    LockRecord, RequestMeta, Source,
};

struct CfNames {
    blocks: &'static str,
    blocks_by_hash: String,
    blocks_by_commit_key: String,
    blocks_by_id: String,
    items: &'static str,
    items_by_source: String,
    cursors: &'static str,
    locks: &'static str,
    actions: &'static str,
}

impl CfNames {
    fn of(kind: LedgerKind) -> Self {
        let c = kind.collections();
        Self {
            blocks: c.blocks,
            blocks_by_hash: format!("{}_by_hash", c.blocks),
            blocks_by_commit_key: format!("{}_by_commit_key", c.blocks),
            blocks_by_id: format!("{}_by_id", c.blocks),
            items: c.items,
            items_by_source: format!("{}_by_source", c.items),
            cursors: c.cursors,
            locks: c.locks,
            actions: c.actions,
        }
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.blocks.to_string(),
            self.blocks_by_hash.clone(),
            self.blocks_by_commit_key.clone(),
            self.blocks_by_id.clone(),
            self.items.to_string(),
            self.items_by_source.clone(),
            self.cursors.to_string(),
            self.locks.to_string(),
            self.actions.to_string(),
        ]
    }
}

fn item_key(block_id: Uuid, idx: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(block_id.as_bytes());
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn source_key(source: Source, source_id: i64) -> Vec<u8> {
    format!("{}:{}", source.as_str(), source_id).into_bytes()
}

fn height_from(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage("Corrupt height index entry".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Storage wrapper for RocksDB
pub struct RocksLedgerStore {
    db: DB,
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl fmt::Debug for RocksLedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksLedgerStore")
            .field("path", &self.path)
            .finish()
    }
}

impl RocksLedgerStore {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.max_background_jobs);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = LedgerKind::ALL
            .iter()
            .flat_map(|kind| CfNames::of(*kind).all())
            .map(|name| {
                let opts = if name.contains("_by_") {
                    Self::cf_options_index()
                } else {
                    Self::cf_options_documents()
                };
                ColumnFamilyDescriptor::new(name, opts)
            })
            .collect();
        let families = cf_descriptors.len();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = families,
            "Opened RocksDB document store"
        );

        Ok(Self {
            db,
            path: path.to_path_buf(),
            write_guard: Mutex::new(()),
        })
    }

    /// Data directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Column family options

    fn cf_options_documents() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helpers

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf_handle(cf)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, mode: IteratorMode<'_>) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(cf, mode) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn scan_take<T: DeserializeOwned>(
        &self,
        cf: &str,
        mode: IteratorMode<'_>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(cf, mode).skip(offset).take(limit) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn count(&self, cf: &str) -> Result<u64> {
        let cf = self.cf_handle(cf)?;
        let mut n = 0;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    fn items_of(&self, names: &CfNames, block_id: Uuid) -> Result<Vec<Item>> {
        let cf = self.cf_handle(names.items)?;
        let prefix = block_id.as_bytes().to_vec();
        let mut items = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl LedgerStore for RocksLedgerStore {
    async fn tip_block(&self, kind: LedgerKind) -> Result<Option<Block>> {
        let names = CfNames::of(kind);
        Ok(self
            .scan_take(names.blocks, IteratorMode::End, 0, 1)?
            .into_iter()
            .next())
    }

    async fn insert_block(&self, kind: LedgerKind, block: &Block) -> Result<()> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();

        let height_key = block.height.to_be_bytes();
        if self.exists(names.blocks, &height_key)? {
            return Err(Error::DuplicateKey(format!("height {}", block.height)));
        }
        if self.exists(&names.blocks_by_hash, block.block_hash.as_bytes())? {
            return Err(Error::DuplicateKey(format!("blockHash {}", block.block_hash)));
        }
        if self.exists(&names.blocks_by_commit_key, block.commit_key.as_bytes())? {
            return Err(Error::DuplicateKey(format!("commitKey {}", block.commit_key)));
        }
        if self.exists(&names.blocks_by_id, block.block_id.as_bytes())? {
            return Err(Error::DuplicateKey(format!("blockId {}", block.block_id)));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(names.blocks)?,
            height_key,
            serde_json::to_vec(block)?,
        );
        batch.put_cf(
            self.cf_handle(&names.blocks_by_hash)?,
            block.block_hash.as_bytes(),
            height_key,
        );
        batch.put_cf(
            self.cf_handle(&names.blocks_by_commit_key)?,
            block.commit_key.as_bytes(),
            height_key,
        );
        batch.put_cf(
            self.cf_handle(&names.blocks_by_id)?,
            block.block_id.as_bytes(),
            height_key,
        );
        self.db.write(batch)?;

        tracing::debug!(ledger = %kind, height = block.height, "Block stored");
        Ok(())
    }

    async fn delete_block(&self, kind: LedgerKind, block_id: Uuid) -> Result<()> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();

        let by_id = self.cf_handle(&names.blocks_by_id)?;
        let Some(height) = self.db.get_cf(by_id, block_id.as_bytes())? else {
            return Ok(());
        };
        let height_key = height_from(&height)?.to_be_bytes();

        let mut batch = WriteBatch::default();
        if let Some(block) = self.get_json::<Block>(names.blocks, &height_key)? {
            batch.delete_cf(
                self.cf_handle(&names.blocks_by_hash)?,
                block.block_hash.as_bytes(),
            );
            batch.delete_cf(
                self.cf_handle(&names.blocks_by_commit_key)?,
                block.commit_key.as_bytes(),
            );
        }
        batch.delete_cf(self.cf_handle(names.blocks)?, height_key);
        batch.delete_cf(by_id, block_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    async fn block_by_height(&self, kind: LedgerKind, height: u64) -> Result<Option<Block>> {
        self.get_json(CfNames::of(kind).blocks, &height.to_be_bytes())
    }

    async fn blocks_ascending(&self, kind: LedgerKind, limit: usize) -> Result<Vec<Block>> {
        self.scan_take(CfNames::of(kind).blocks, IteratorMode::Start, 0, limit)
    }

    async fn blocks_descending(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Block>> {
        self.scan_take(CfNames::of(kind).blocks, IteratorMode::End, offset, limit)
    }

    async fn count_blocks(&self, kind: LedgerKind) -> Result<u64> {
        self.count(CfNames::of(kind).blocks)
    }

    async fn mark_finalized(
        &self,
        kind: LedgerKind,
        height: u64,
        finalized_at: DateTime<Utc>,
        finalized_by: &str,
        meta: &RequestMeta,
    ) -> Result<bool> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let key = height.to_be_bytes();
        let Some(mut block) = self.get_json::<Block>(names.blocks, &key)? else {
            return Ok(false);
        };
        if block.status != BlockStatus::Sealed {
            return Ok(false);
        }
        block.status = BlockStatus::Finalized;
        block.finalized_at = Some(finalized_at);
        block.finalized_by_user_id = Some(finalized_by.to_string());
        block.finalize_meta = Some(meta.clone());
        self.put_json(names.blocks, &key, &block)?;
        Ok(true)
    }

    async fn insert_items(&self, kind: LedgerKind, items: &[Item]) -> Result<()> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();

        let mut seen = HashSet::new();
        for item in items {
            let key = item_key(item.block_id, item.idx);
            if self.exists(names.items, &key)? {
                return Err(Error::DuplicateKey(format!("item {}#{}", item.block_id, item.idx)));
            }
            let by_source = source_key(item.source, item.source_id);
            if !seen.insert(by_source.clone()) || self.exists(&names.items_by_source, &by_source)? {
                return Err(Error::DuplicateKey(format!(
                    "{}#{} already sealed",
                    item.source, item.source_id
                )));
            }
        }

        let items_cf = self.cf_handle(names.items)?;
        let source_cf = self.cf_handle(&names.items_by_source)?;
        let mut batch = WriteBatch::default();
        for item in items {
            let key = item_key(item.block_id, item.idx);
            batch.put_cf(items_cf, &key, serde_json::to_vec(item)?);
            batch.put_cf(source_cf, source_key(item.source, item.source_id), &key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn delete_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<u64> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let items = self.items_of(&names, block_id)?;

        let items_cf = self.cf_handle(names.items)?;
        let source_cf = self.cf_handle(&names.items_by_source)?;
        let mut batch = WriteBatch::default();
        for item in &items {
            batch.delete_cf(items_cf, item_key(item.block_id, item.idx));
            batch.delete_cf(source_cf, source_key(item.source, item.source_id));
        }
        self.db.write(batch)?;
        Ok(items.len() as u64)
    }

    async fn block_items(&self, kind: LedgerKind, block_id: Uuid) -> Result<Vec<Item>> {
        self.items_of(&CfNames::of(kind), block_id)
    }

    async fn item_at(&self, kind: LedgerKind, block_id: Uuid, idx: u32) -> Result<Option<Item>> {
        self.get_json(CfNames::of(kind).items, &item_key(block_id, idx))
    }

    async fn cursor(&self, kind: LedgerKind, source: Source) -> Result<Option<Cursor>> {
        self.get_json(CfNames::of(kind).cursors, source.as_str().as_bytes())
    }

    async fn set_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        last_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let cursor = Cursor {
            source,
            last_id,
            updated_at: at,
        };
        self.put_json(CfNames::of(kind).cursors, source.as_str().as_bytes(), &cursor)
    }

    async fn restore_cursor(
        &self,
        kind: LedgerKind,
        source: Source,
        written: i64,
        previous: Option<&Cursor>,
    ) -> Result<bool> {
        let names = CfNames::of(kind);
        let key = source.as_str().as_bytes();
        let _guard = self.write_guard.lock();
        let current: Option<Cursor> = self.get_json(names.cursors, key)?;
        if current.map(|c| c.last_id) != Some(written) {
            return Ok(false);
        }
        match previous {
            Some(cursor) => self.put_json(names.cursors, key, cursor)?,
            None => self.db.delete_cf(self.cf_handle(names.cursors)?, key)?,
        }
        Ok(true)
    }

    async fn claim_lock(&self, kind: LedgerKind, claim: &LockClaim) -> Result<LockRecord> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let existing: Option<LockRecord> = self.get_json(names.locks, claim.key.as_bytes())?;
        if let Some(current) = &existing {
            if !claim.admits(current) {
                return Ok(current.clone());
            }
        }
        let next = claim.to_record(existing.as_ref());
        self.put_json(names.locks, claim.key.as_bytes(), &next)?;
        Ok(next)
    }

    async fn renew_lock(
        &self,
        kind: LedgerKind,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        match self.get_json::<LockRecord>(names.locks, key.as_bytes())? {
            Some(mut record) if record.owner.as_deref() == Some(owner) => {
                record.expires_at = expires_at.into();
                record.updated_at = now.into();
                self.put_json(names.locks, key.as_bytes(), &record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, kind: LedgerKind, key: &str, owner: &str) -> Result<bool> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        match self.get_json::<LockRecord>(names.locks, key.as_bytes())? {
            Some(record) if record.owner.as_deref() == Some(owner) => {
                self.db
                    .delete_cf(self.cf_handle(names.locks)?, key.as_bytes())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, kind: LedgerKind, key: &str) -> Result<Option<LockRecord>> {
        self.get_json(CfNames::of(kind).locks, key.as_bytes())
    }

    async fn list_locks(&self, kind: LedgerKind) -> Result<Vec<LockRecord>> {
        self.scan(CfNames::of(kind).locks, IteratorMode::Start)
    }

    async fn delete_locks(&self, kind: LedgerKind, filter: &LockFilter) -> Result<Vec<String>> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let records: Vec<LockRecord> = self.scan(names.locks, IteratorMode::Start)?;
        let cf = self.cf_handle(names.locks)?;
        let mut batch = WriteBatch::default();
        let mut keys = Vec::new();
        for record in records.into_iter().filter(|r| filter.matches(r)) {
            batch.delete_cf(cf, record.key.as_bytes());
            keys.push(record.key);
        }
        self.db.write(batch)?;
        Ok(keys)
    }

    async fn insert_action(&self, kind: LedgerKind, action: &AdminAction) -> Result<()> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        if self.exists(names.actions, action.id.as_bytes())? {
            return Err(Error::DuplicateKey(format!("action {}", action.id)));
        }
        self.put_json(names.actions, action.id.as_bytes(), action)
    }

    async fn begin_keyed_action(
        &self,
        kind: LedgerKind,
        action: &AdminAction,
    ) -> Result<Option<AdminAction>> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let key = action.id.as_bytes();
        match self.get_json::<AdminAction>(names.actions, key)? {
            None => {
                self.put_json(names.actions, key, action)?;
                Ok(None)
            }
            Some(existing) if is_restartable(&existing) => {
                let mut restarted = existing.clone();
                restarted.status = ActionStatus::InProgress;
                restarted.meta = action.meta.clone();
                restarted.result = None;
                restarted.error = None;
                restarted.updated_at = action.updated_at;
                self.put_json(names.actions, key, &restarted)?;
                Ok(Some(existing))
            }
            Some(existing) => Ok(Some(existing)),
        }
    }

    async fn finish_action(
        &self,
        kind: LedgerKind,
        id: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let names = CfNames::of(kind);
        let _guard = self.write_guard.lock();
        let mut action: AdminAction = self
            .get_json(names.actions, id.as_bytes())?
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
        self.put_json(names.actions, id.as_bytes(), &action)
    }

    async fn list_actions(
        &self,
        kind: LedgerKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AdminAction>> {
        let mut actions: Vec<AdminAction> =
            self.scan(CfNames::of(kind).actions, IteratorMode::Start)?;
        actions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(actions.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_actions(&self, kind: LedgerKind) -> Result<u64> {
        self.count(CfNames::of(kind).actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open() -> (RocksLedgerStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        (RocksLedgerStore::open(&config).unwrap(), temp_dir)
    }

    fn block(height: u64) -> Block {
        Block {
            block_id: Uuid::now_v7(),
            height,
            prev_hash: format!("prev-{}", height),
            merkle_root: format!("root-{}", height),
            commit_key: format!("ck-{}", height),
            block_hash: format!("hash-{}", height),
            sealed_by_user_id: "SYSTEM".into(),
            items_count: 1,
            status: BlockStatus::Sealed,
            sources: BTreeMap::new(),
            created_at: Utc::now(),
            version: 1,
            finalized_at: None,
            finalized_by_user_id: None,
            finalize_meta: None,
        }
    }

    fn item(block: &Block, idx: u32, source_id: i64) -> Item {
        Item {
            block_id: block.block_id,
            block_height: block.height,
            idx,
            source: Source::SecurityLogs,
            source_id,
            created_at: Utc::now(),
            payload: json!({ "id": source_id }),
            payload_hash: format!("leaf-{}", source_id),
        }
    }

    #[tokio::test]
    async fn test_storage_open() {
        let (store, dir) = open();
        assert_eq!(store.path(), dir.path());
        assert!(store.tip_block(LedgerKind::Audit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocks_round_trip_and_order() {
        let (store, _dir) = open();
        let kind = LedgerKind::Audit;
        for h in 1..=3 {
            store.insert_block(kind, &block(h)).await.unwrap();
        }
        assert_eq!(store.tip_block(kind).await.unwrap().unwrap().height, 3);
        assert_eq!(store.count_blocks(kind).await.unwrap(), 3);

        let desc = store.blocks_descending(kind, 2, 1).await.unwrap();
        assert_eq!(desc.iter().map(|b| b.height).collect::<Vec<_>>(), vec![2, 1]);

        let dup = store.insert_block(kind, &block(2)).await;
        assert!(matches!(dup, Err(Error::DuplicateKey(_))));
        assert!(store.tip_block(LedgerKind::Settlement).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_items_and_compensation() {
        let (store, _dir) = open();
        let kind = LedgerKind::Audit;
        let b = block(1);
        store.insert_block(kind, &b).await.unwrap();
        store
            .insert_items(kind, &[item(&b, 0, 10), item(&b, 1, 11)])
            .await
            .unwrap();

        let items = store.block_items(kind, b.block_id).await.unwrap();
        assert_eq!(items.iter().map(|i| i.idx).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            store.item_at(kind, b.block_id, 1).await.unwrap().unwrap().source_id,
            11
        );

        let b2 = block(2);
        let resealed = store.insert_items(kind, &[item(&b2, 0, 10)]).await;
        assert!(matches!(resealed, Err(Error::DuplicateKey(_))));

        assert_eq!(store.delete_items(kind, b.block_id).await.unwrap(), 2);
        store.delete_block(kind, b.block_id).await.unwrap();
        assert!(store.tip_block(kind).await.unwrap().is_none());
        // Indexes were cleared with the block
        store.insert_block(kind, &block(1)).await.unwrap();
        store.insert_items(kind, &[item(&b2, 0, 10)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_once() {
        let (store, _dir) = open();
        let kind = LedgerKind::Settlement;
        store.insert_block(kind, &block(1)).await.unwrap();
        let meta = RequestMeta::default();
        assert!(store.mark_finalized(kind, 1, Utc::now(), "admin", &meta).await.unwrap());
        assert!(!store.mark_finalized(kind, 1, Utc::now(), "admin", &meta).await.unwrap());
        assert!(!store.mark_finalized(kind, 9, Utc::now(), "admin", &meta).await.unwrap());
        let stored = store.block_by_height(kind, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, BlockStatus::Finalized);
        assert_eq!(stored.finalized_by_user_id.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_cursor_and_locks() {
        let (store, _dir) = open();
        let kind = LedgerKind::Settlement;
        assert!(store.cursor(kind, Source::TradeFills).await.unwrap().is_none());
        store
            .set_cursor(kind, Source::TradeFills, 42, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.cursor(kind, Source::TradeFills).await.unwrap().unwrap().last_id,
            42
        );
        assert!(!store
            .restore_cursor(kind, Source::TradeFills, 41, None)
            .await
            .unwrap());
        assert!(store
            .restore_cursor(kind, Source::TradeFills, 42, None)
            .await
            .unwrap());
        assert!(store.cursor(kind, Source::TradeFills).await.unwrap().is_none());

        let now = Utc::now();
        let claim = LockClaim {
            key: kind.lock_key().into(),
            owner: "srv:a".into(),
            now,
            expires_at: now + chrono::Duration::seconds(30),
            stale_before: now - chrono::Duration::seconds(60),
            invalid_after: now + chrono::Duration::seconds(120),
        };
        let record = store.claim_lock(kind, &claim).await.unwrap();
        assert_eq!(record.owner.as_deref(), Some("srv:a"));
        assert!(store
            .renew_lock(kind, kind.lock_key(), "srv:a", now, now)
            .await
            .unwrap());
        let deleted = store.delete_locks(kind, &LockFilter::All).await.unwrap();
        assert_eq!(deleted, vec![kind.lock_key().to_string()]);
    }
}
