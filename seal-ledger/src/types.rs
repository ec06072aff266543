//! Core types for the ledger
//!
//! Documents stored in the ledger use camelCase JSON field names, which is
//! also the shape admin callers see. Money stays `Decimal` end to end.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Which of the two ledger pipelines an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    /// Money movements: wallet transactions and trade fills
    Settlement,
    /// Security log events
    Audit,
}

/// Collection names backing one ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collections {
    /// Sealed blocks
    pub blocks: &'static str,
    /// Sealed items
    pub items: &'static str,
    /// Per-source cursors
    pub cursors: &'static str,
    /// Lock documents
    pub locks: &'static str,
    /// Admin action log
    pub actions: &'static str,
}

impl LedgerKind {
    /// Both ledgers, settlement first
    pub const ALL: [LedgerKind; 2] = [LedgerKind::Settlement, LedgerKind::Audit];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Settlement => "settlement",
            LedgerKind::Audit => "audit",
        }
    }

    /// Document collections for this ledger
    pub fn collections(&self) -> Collections {
        match self {
            LedgerKind::Settlement => Collections {
                blocks: "ledger_blocks",
                items: "ledger_items",
                cursors: "ledger_cursors",
                locks: "ledger_locks",
                actions: "ledger_admin_actions",
            },
            LedgerKind::Audit => Collections {
                blocks: "audit_blocks",
                items: "audit_items",
                cursors: "audit_cursors",
                locks: "audit_locks",
                actions: "audit_admin_actions",
            },
        }
    }

    /// Key of the single commit lock
    pub fn lock_key(&self) -> &'static str {
        match self {
            LedgerKind::Settlement => "ledger_commit_next_block",
            LedgerKind::Audit => "audit_commit_next_block",
        }
    }

    /// Action name recorded in the admin action log
    pub fn action_name(&self) -> &'static str {
        match self {
            LedgerKind::Settlement => "COMMIT",
            LedgerKind::Audit => "AUDIT_COMMIT",
        }
    }

    /// Log event emitted after a block is sealed
    pub fn committed_event(&self) -> &'static str {
        match self {
            LedgerKind::Settlement => "ledger_block_committed",
            LedgerKind::Audit => "audit_ledger_block_committed",
        }
    }

    /// Message of the conflict raised while a commit of this ledger runs
    pub fn commit_in_progress_message(&self) -> &'static str {
        match self {
            LedgerKind::Settlement => "Ledger commit already in progress",
            LedgerKind::Audit => "Audit ledger commit already in progress",
        }
    }

    /// Source tables sealed by this ledger, in fetch order
    pub fn sources(&self) -> &'static [Source] {
        match self {
            LedgerKind::Settlement => &[Source::WalletTransactions, Source::TradeFills],
            LedgerKind::Audit => &[Source::SecurityLogs],
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relational source table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// `wallet_transactions`
    WalletTransactions,
    /// `trade_fills`
    TradeFills,
    /// `security_logs`
    SecurityLogs,
}

impl Source {
    /// Table name, also the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::WalletTransactions => "wallet_transactions",
            Source::TradeFills => "trade_fills",
            Source::SecurityLogs => "security_logs",
        }
    }

    /// Ledger this source is sealed into
    pub fn ledger(&self) -> LedgerKind {
        match self {
            Source::WalletTransactions | Source::TradeFills => LedgerKind::Settlement,
            Source::SecurityLogs => LedgerKind::Audit,
        }
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wallet_transactions" => Ok(Source::WalletTransactions),
            "trade_fills" => Ok(Source::TradeFills),
            "security_logs" => Ok(Source::SecurityLogs),
            other => Err(Error::Validation(format!("Unknown ledger source: {}", other))),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    /// Written by the sealer
    Sealed,
    /// Re-verified and marked by an admin
    Finalized,
}

/// Cursor position of one source at seal time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    /// Rows with id greater than this were candidates
    pub from_id_exclusive: i64,
}

/// Request metadata carried into action logs and finalize records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Correlation id of the originating request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Admin user that triggered the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user_id: Option<String>,
    /// Client address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Client user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Client device id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Sealed block header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Document id referenced by items
    pub block_id: Uuid,
    /// 1-based height
    pub height: u64,
    /// Hash of the previous block, or GENESIS
    pub prev_hash: String,
    /// Merkle root over item leaf hashes
    pub merkle_root: String,
    /// sha256("{height}|{prevHash}|{merkleRoot}")
    pub commit_key: String,
    /// Hash of the canonical header
    pub block_hash: String,
    /// User credited with the seal
    pub sealed_by_user_id: String,
    /// Number of items
    pub items_count: usize,
    /// Lifecycle status
    pub status: BlockStatus,
    /// Cursor snapshot taken before the seal
    pub sources: BTreeMap<Source, SourceSnapshot>,
    /// Seal time
    pub created_at: DateTime<Utc>,
    /// Document version
    pub version: u32,
    /// Set when finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set when finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_by_user_id: Option<String>,
    /// Set when finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_meta: Option<RequestMeta>,
}

impl Block {
    /// Height and hash of this block
    pub fn tip(&self) -> TipRef {
        TipRef {
            height: self.height,
            block_hash: self.block_hash.clone(),
        }
    }
}

/// Sealed snapshot of one source row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Owning block
    pub block_id: Uuid,
    /// Owning block height
    pub block_height: u64,
    /// 0-based position inside the block
    pub idx: u32,
    /// Source table
    pub source: Source,
    /// Row id in the source table
    pub source_id: i64,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Normalized payload
    pub payload: Value,
    /// Leaf hash
    pub payload_hash: String,
}

/// Last sealed id per source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Source table
    pub source: Source,
    /// Highest id sealed so far
    pub last_id: i64,
    /// Last advance
    pub updated_at: DateTime<Utc>,
}

/// Height and hash of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipRef {
    /// Height (0 for the empty chain)
    pub height: u64,
    /// Block hash (GENESIS for the empty chain)
    pub block_hash: String,
}

/// Timestamp as recorded in a lock document, which may be missing or corrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<Value>", into = "Option<Value>")]
pub enum RecordedTime {
    /// Field absent or null
    Missing,
    /// Valid timestamp
    At(DateTime<Utc>),
    /// Present but not a timestamp
    Corrupt(Value),
}

impl RecordedTime {
    /// Valid timestamp, if any
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            RecordedTime::At(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Display form for diagnostics
    pub fn describe(&self) -> Option<String> {
        match self {
            RecordedTime::Missing => None,
            RecordedTime::At(ts) => Some(crate::canonical::iso_millis(ts)),
            RecordedTime::Corrupt(raw) => Some(raw.to_string()),
        }
    }
}

impl Default for RecordedTime {
    fn default() -> Self {
        RecordedTime::Missing
    }
}

impl From<Option<Value>> for RecordedTime {
    fn from(raw: Option<Value>) -> Self {
        match raw {
            None | Some(Value::Null) => RecordedTime::Missing,
            Some(Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(ts) => RecordedTime::At(ts.with_timezone(&Utc)),
                Err(_) => RecordedTime::Corrupt(Value::String(s)),
            },
            Some(other) => RecordedTime::Corrupt(other),
        }
    }
}

impl From<RecordedTime> for Option<Value> {
    fn from(time: RecordedTime) -> Self {
        match time {
            RecordedTime::Missing => None,
            RecordedTime::At(ts) => Some(Value::String(ts.to_rfc3339())),
            RecordedTime::Corrupt(raw) => Some(raw),
        }
    }
}

impl From<DateTime<Utc>> for RecordedTime {
    fn from(ts: DateTime<Utc>) -> Self {
        RecordedTime::At(ts)
    }
}

/// Lock document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Lock key
    pub key: String,
    /// Current owner token
    #[serde(default)]
    pub owner: Option<String>,
    /// Expiry
    #[serde(default)]
    pub expires_at: RecordedTime,
    /// Last acquisition or heartbeat
    #[serde(default)]
    pub updated_at: RecordedTime,
    /// First acquisition
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Parameters of one acquisition attempt
#[derive(Debug, Clone)]
pub struct LockClaim {
    /// Lock key
    pub key: String,
    /// Candidate owner token
    pub owner: String,
    /// Attempt time
    pub now: DateTime<Utc>,
    /// Expiry to record on success
    pub expires_at: DateTime<Utc>,
    /// Records last updated at or before this are stale
    pub stale_before: DateTime<Utc>,
    /// Expiries beyond this are implausible
    pub invalid_after: DateTime<Utc>,
}

impl LockClaim {
    /// Whether an existing lock document may be taken over by this claim
    pub fn admits(&self, existing: &LockRecord) -> bool {
        if existing.owner.as_deref().map_or(true, |owner| owner == self.owner) {
            return true;
        }
        let expiry_allows = match &existing.expires_at {
            RecordedTime::Missing | RecordedTime::Corrupt(_) => true,
            RecordedTime::At(ts) => *ts <= self.now || *ts > self.invalid_after,
        };
        // A non-timestamp heartbeat is not evidence of staleness
        let heartbeat_stale = match &existing.updated_at {
            RecordedTime::Missing => true,
            RecordedTime::Corrupt(_) => false,
            RecordedTime::At(ts) => *ts <= self.stale_before,
        };
        expiry_allows || heartbeat_stale
    }

    /// Document written when the claim wins
    pub fn to_record(&self, previous: Option<&LockRecord>) -> LockRecord {
        LockRecord {
            key: self.key.clone(),
            owner: Some(self.owner.clone()),
            expires_at: RecordedTime::At(self.expires_at),
            updated_at: RecordedTime::At(self.now),
            created_at: previous.and_then(|p| p.created_at).or(Some(self.now)),
        }
    }
}

/// Admin action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Started, not finished
    InProgress,
    /// Finished with a result
    Success,
    /// Finished with an error
    Failed,
}

/// Error recorded on a failed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    /// Error message
    pub message: String,
    /// HTTP-class status
    pub status: u16,
    /// Structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&Error> for ActionError {
    fn from(err: &Error) -> Self {
        let body = err.to_body();
        ActionError {
            message: body.message,
            status: body.status,
            details: body.details,
        }
    }
}

/// Admin action log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAction {
    /// `commit:{key}` when keyed, otherwise a UUIDv7
    pub id: String,
    /// COMMIT or AUDIT_COMMIT
    pub action: String,
    /// Status
    pub status: ActionStatus,
    /// Caller-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Request metadata
    #[serde(flatten)]
    pub meta: RequestMeta,
    /// Outcome on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// First start
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

/// Pointer written onto every row sealed in one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackPointer {
    /// Block height
    pub height: u64,
    /// Block hash
    pub block_hash: String,
    /// Block commit key
    pub commit_key: String,
    /// Seal time
    pub committed_at: DateTime<Utc>,
}

/// Back-pointer columns as currently stored on a row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPointers {
    /// `ledger_block_height`
    pub height: Option<u64>,
    /// `ledger_block_hash`
    pub block_hash: Option<String>,
    /// `ledger_commit_key`
    pub commit_key: Option<String>,
    /// `ledger_item_idx`
    pub item_idx: Option<u32>,
    /// `ledger_committed_at`
    pub committed_at: Option<DateTime<Utc>>,
}

/// `wallet_transactions` row
#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransactionRow {
    /// Row id
    pub id: i64,
    /// Owner
    pub user_id: String,
    /// Transaction type
    pub tx_type: String,
    /// Signed amount
    pub amount: Decimal,
    /// Balance after the transaction
    pub balance_after: Decimal,
    /// Free text
    pub description: Option<String>,
    /// Business reference shared with trade fills
    pub reference_id: Option<String>,
    /// Status (CONFIRMED, ...)
    pub status: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// `trade_fills` row
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFillRow {
    /// Row id
    pub id: i64,
    /// Owner
    pub user_id: String,
    /// BUY or SELL
    pub side: String,
    /// Instrument
    pub symbol: String,
    /// Quantity
    pub qty: Decimal,
    /// Fill price
    pub price: Decimal,
    /// Gross quote amount
    pub gross_quote: Decimal,
    /// Fee in quote currency
    pub fee_quote: Decimal,
    /// Net quote amount
    pub net_quote: Decimal,
    /// Linked wallet transaction
    pub wallet_tx_id: Option<i64>,
    /// Business reference
    pub reference_id: Option<String>,
    /// Originating request
    pub request_id: Option<String>,
    /// Status (FILLED, REVERSED, ...)
    pub status: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// `security_logs` row
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityLogRow {
    /// Row id
    pub id: i64,
    /// Subject user, absent for anonymous events
    pub user_id: Option<String>,
    /// Event type
    pub event_type: String,
    /// Client address
    pub ip: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Free-form JSON
    pub metadata: Option<Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A row of any source table
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// Wallet transaction
    Wallet(WalletTransactionRow),
    /// Trade fill
    Trade(TradeFillRow),
    /// Security log event
    Security(SecurityLogRow),
}

impl SourceRow {
    /// Table the row belongs to
    pub fn source(&self) -> Source {
        match self {
            SourceRow::Wallet(_) => Source::WalletTransactions,
            SourceRow::Trade(_) => Source::TradeFills,
            SourceRow::Security(_) => Source::SecurityLogs,
        }
    }

    /// Row id
    pub fn id(&self) -> i64 {
        match self {
            SourceRow::Wallet(row) => row.id,
            SourceRow::Trade(row) => row.id,
            SourceRow::Security(row) => row.id,
        }
    }

    /// Owning user, if any
    pub fn user_id(&self) -> Option<&str> {
        match self {
            SourceRow::Wallet(row) => Some(row.user_id.as_str()),
            SourceRow::Trade(row) => Some(row.user_id.as_str()),
            SourceRow::Security(row) => row.user_id.as_deref(),
        }
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            SourceRow::Wallet(row) => row.created_at,
            SourceRow::Trade(row) => row.created_at,
            SourceRow::Security(row) => row.created_at,
        }
    }
}

/// A source row together with its back-pointer columns
#[derive(Debug, Clone, PartialEq)]
pub struct PointedRow {
    /// Row
    pub row: SourceRow,
    /// Back-pointers
    pub pointers: RowPointers,
}

/// Page of results with the unpaged total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Total matching documents
    pub total: u64,
    /// This page
    pub items: Vec<T>,
}

/// Largest page served by list operations
pub const MAX_PAGE_LIMIT: usize = 200;

/// Reject page sizes outside `1..=MAX_PAGE_LIMIT`
pub fn check_page_limit(limit: usize) -> Result<()> {
    if (1..=MAX_PAGE_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claim(now: DateTime<Utc>) -> LockClaim {
        LockClaim {
            key: "k".into(),
            owner: "srv:new".into(),
            now,
            expires_at: now + Duration::seconds(30),
            stale_before: now - Duration::seconds(60),
            invalid_after: now + Duration::seconds(120),
        }
    }

    fn held(now: DateTime<Utc>) -> LockRecord {
        LockRecord {
            key: "k".into(),
            owner: Some("srv:old".into()),
            expires_at: RecordedTime::At(now + Duration::seconds(20)),
            updated_at: RecordedTime::At(now - Duration::seconds(5)),
            created_at: Some(now - Duration::seconds(5)),
        }
    }

    #[test]
    fn test_source_names() {
        assert_eq!("trade_fills".parse::<Source>().unwrap(), Source::TradeFills);
        assert!(matches!("orders".parse::<Source>(), Err(Error::Validation(_))));
        assert_eq!(Source::SecurityLogs.ledger(), LedgerKind::Audit);
        assert_eq!(
            serde_json::to_value(Source::WalletTransactions).unwrap(),
            "wallet_transactions"
        );
    }

    #[test]
    fn test_live_lock_is_not_admitted() {
        let now = Utc::now();
        assert!(!claim(now).admits(&held(now)));
    }

    #[test]
    fn test_lock_takeover_conditions() {
        let now = Utc::now();
        let c = claim(now);

        let mut expired = held(now);
        expired.expires_at = RecordedTime::At(now);
        assert!(c.admits(&expired));

        let mut corrupt = held(now);
        corrupt.expires_at = RecordedTime::Corrupt(Value::String("soon".into()));
        assert!(c.admits(&corrupt));

        let mut far_future = held(now);
        far_future.expires_at = RecordedTime::At(now + Duration::days(365));
        assert!(c.admits(&far_future));

        let mut stale = held(now);
        stale.updated_at = RecordedTime::At(now - Duration::seconds(61));
        assert!(c.admits(&stale));

        let mut no_heartbeat = held(now);
        no_heartbeat.updated_at = RecordedTime::Missing;
        assert!(c.admits(&no_heartbeat));

        let mut unowned = held(now);
        unowned.owner = None;
        assert!(c.admits(&unowned));

        let mut mine = held(now);
        mine.owner = Some("srv:new".into());
        assert!(c.admits(&mine));
    }

    #[test]
    fn test_corrupt_heartbeat_keeps_live_lock() {
        let now = Utc::now();
        let c = claim(now);

        let mut garbled = held(now);
        garbled.updated_at = RecordedTime::Corrupt(Value::String("yesterday".into()));
        assert!(!c.admits(&garbled));

        // Still taken over once the expiry itself allows it
        garbled.expires_at = RecordedTime::At(now - Duration::seconds(1));
        assert!(c.admits(&garbled));
    }

    #[test]
    fn test_recorded_time_serde() {
        let raw = serde_json::json!({
            "key": "k",
            "owner": "srv:1",
            "expiresAt": 12345,
        });
        let record: LockRecord = serde_json::from_value(raw).unwrap();
        assert!(matches!(record.expires_at, RecordedTime::Corrupt(_)));
        assert_eq!(record.updated_at, RecordedTime::Missing);

        let now = Utc::now();
        let record = claim(now).to_record(None);
        let back: LockRecord =
            serde_json::from_value(serde_json::to_value(&record).unwrap()).unwrap();
        assert_eq!(back.expires_at.at(), record.expires_at.at());
    }
}
