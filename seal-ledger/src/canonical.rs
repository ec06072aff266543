//! Canonical JSON and hashing
//!
//! Every hash the ledger stores is the lowercase hex SHA-256 of a UTF-8
//! string. Structured values are hashed through their canonical JSON form:
//! object keys sorted recursively, compact separators, timestamps rendered
//! as ISO-8601 UTC with millisecond precision.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{Source, SourceRow};

/// Seed of the chain
pub const GENESIS_SEED: &str = "GENESIS";

/// Seed of the root of an empty leaf set
pub const EMPTY_BLOCK_SEED: &str = "EMPTY_BLOCK";

/// Lowercase hex SHA-256 of a string
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Previous hash of block 1
pub fn genesis_hash() -> String {
    sha256_hex(GENESIS_SEED)
}

/// Merkle root of an empty leaf set
pub fn empty_block_hash() -> String {
    sha256_hex(EMPTY_BLOCK_SEED)
}

/// `2024-01-02T03:04:05.678Z`
pub fn iso_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sort object keys recursively
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON of the canonicalized value
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// sha256("{height}|{prevHash}|{merkleRoot}")
pub fn commit_key(height: u64, prev_hash: &str, merkle_root: &str) -> String {
    sha256_hex(&format!("{}|{}|{}", height, prev_hash, merkle_root))
}

/// Hash of the canonical block header
pub fn block_hash(
    height: u64,
    prev_hash: &str,
    merkle_root: &str,
    commit_key: &str,
    sealed_by_user_id: &str,
) -> String {
    let header = json!({
        "height": height,
        "prevHash": prev_hash,
        "merkleRoot": merkle_root,
        "commitKey": commit_key,
        "sealedByUserId": sealed_by_user_id,
    });
    sha256_hex(&canonical_json(&header))
}

/// Leaf hash of a normalized payload
pub fn leaf_hash(source: Source, payload: &Value) -> String {
    let envelope = json!({ "source": source.as_str(), "payload": payload });
    sha256_hex(&canonical_json(&envelope))
}

/// A source row reduced to its sealed form
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    /// Source table
    pub source: Source,
    /// Row id
    pub source_id: i64,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// `createdAt` as it appears in the payload
    pub created_at_iso: String,
    /// Normalized payload
    pub payload: Value,
    /// Leaf hash
    pub payload_hash: String,
}

/// Normalize a row of `source` into its payload and leaf hash
pub fn normalize(source: Source, row: &SourceRow) -> Result<NormalizedItem> {
    if row.source() != source {
        return Err(Error::Other(format!(
            "row {} of {} cannot be normalized as {}",
            row.id(),
            row.source(),
            source
        )));
    }

    let created_at = row.created_at();
    let created_at_iso = iso_millis(&created_at);
    let payload = match row {
        SourceRow::Security(r) => json!({
            "id": r.id,
            "userId": r.user_id,
            "eventType": r.event_type,
            "ip": r.ip,
            "userAgent": r.user_agent,
            "metadata": r.metadata,
            "createdAt": created_at_iso,
        }),
        SourceRow::Wallet(r) => json!({
            "id": r.id,
            "userId": r.user_id,
            "type": r.tx_type,
            "amount": r.amount.to_string(),
            "balanceAfter": r.balance_after.to_string(),
            "description": r.description,
            "referenceId": r.reference_id,
            "status": r.status,
            "createdAt": created_at_iso,
        }),
        SourceRow::Trade(r) => json!({
            "id": r.id,
            "userId": r.user_id,
            "side": r.side,
            "symbol": r.symbol,
            "qty": r.qty.to_string(),
            "price": r.price.to_string(),
            "grossQuote": r.gross_quote.to_string(),
            "feeQuote": r.fee_quote.to_string(),
            "netQuote": r.net_quote.to_string(),
            "walletTxId": r.wallet_tx_id,
            "referenceId": r.reference_id,
            "requestId": r.request_id,
            "status": r.status,
            "createdAt": created_at_iso,
        }),
    };
    let payload_hash = leaf_hash(source, &payload);

    Ok(NormalizedItem {
        source,
        source_id: row.id(),
        created_at,
        created_at_iso,
        payload,
        payload_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WalletTransactionRow;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn wallet_row() -> SourceRow {
        SourceRow::Wallet(WalletTransactionRow {
            id: 7,
            user_id: "u-1".into(),
            tx_type: "DEPOSIT".into(),
            amount: Decimal::from_str("100.50000000").unwrap(),
            balance_after: Decimal::from_str("100.50000000").unwrap(),
            description: None,
            reference_id: Some("ref-7".into()),
            status: "CONFIRMED".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
                + chrono::Duration::milliseconds(678),
        })
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            sha256_hex("GENESIS"),
            "901131d838b17aac0f7885b81e03cbdc9f5157a00343d30ab22083685ed1416a"
        );
        assert_eq!(genesis_hash(), sha256_hex("GENESIS"));
        assert_eq!(empty_block_hash(), sha256_hex("EMPTY_BLOCK"));
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_canonical_key_order() {
        let a = json!({ "b": 1, "a": { "d": [ { "z": 1, "y": 2 } ], "c": null } });
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"d":[{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_iso_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(iso_millis(&ts), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_commit_key_format() {
        assert_eq!(commit_key(3, "aa", "bb"), sha256_hex("3|aa|bb"));
    }

    #[test]
    fn test_block_hash_uses_canonical_header() {
        let expected = sha256_hex(
            r#"{"commitKey":"ck","height":1,"merkleRoot":"mr","prevHash":"ph","sealedByUserId":"SYSTEM"}"#,
        );
        assert_eq!(block_hash(1, "ph", "mr", "ck", "SYSTEM"), expected);
    }

    #[test]
    fn test_normalize_wallet_row() {
        let item = normalize(Source::WalletTransactions, &wallet_row()).unwrap();
        assert_eq!(item.source_id, 7);
        assert_eq!(item.payload["amount"], "100.50000000");
        assert_eq!(item.payload["type"], "DEPOSIT");
        assert_eq!(item.payload["description"], Value::Null);
        assert_eq!(item.payload["createdAt"], "2024-01-02T03:04:05.678Z");
        assert_eq!(
            item.payload_hash,
            leaf_hash(Source::WalletTransactions, &item.payload)
        );
    }

    #[test]
    fn test_normalize_rejects_mismatched_source() {
        assert!(normalize(Source::TradeFills, &wallet_row()).is_err());
    }

    #[test]
    fn test_leaf_hash_depends_on_source() {
        let payload = json!({ "id": 1 });
        assert_ne!(
            leaf_hash(Source::TradeFills, &payload),
            leaf_hash(Source::WalletTransactions, &payload)
        );
    }
}
