//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use seal_ledger::{
    store::{MemoryLedgerStore, MemorySourceStore},
    types::{SecurityLogRow, SourceRow, TradeFillRow, WalletTransactionRow},
    Config, Ledger,
};
use std::sync::Arc;

/// Fixed base time so ordering assertions are reproducible
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
}

pub fn wallet(id: i64, user: &str, secs: i64) -> SourceRow {
    SourceRow::Wallet(WalletTransactionRow {
        id,
        user_id: user.to_string(),
        tx_type: "TRADE_SETTLEMENT".to_string(),
        amount: Decimal::new(-2_500_00 - id, 2),
        balance_after: Decimal::new(10_000_00, 2),
        description: Some(format!("fill {}", id)),
        reference_id: Some(format!("ref-{}", id)),
        status: "CONFIRMED".to_string(),
        created_at: at(secs),
    })
}

pub fn trade(id: i64, user: &str, secs: i64, reference: &str) -> SourceRow {
    SourceRow::Trade(TradeFillRow {
        id,
        user_id: user.to_string(),
        side: "BUY".to_string(),
        symbol: "BTC-USD".to_string(),
        qty: Decimal::new(5, 3),
        price: Decimal::new(42_000_00, 2),
        gross_quote: Decimal::new(210_00, 2),
        fee_quote: Decimal::new(21, 2),
        net_quote: Decimal::new(210_21, 2),
        wallet_tx_id: None,
        reference_id: Some(reference.to_string()),
        request_id: Some(format!("req-{}", id)),
        status: "FILLED".to_string(),
        created_at: at(secs),
    })
}

pub fn security(id: i64, user: Option<&str>, secs: i64) -> SourceRow {
    SourceRow::Security(SecurityLogRow {
        id,
        user_id: user.map(str::to_string),
        event_type: "LOGIN_SUCCESS".to_string(),
        ip: Some("192.0.2.10".to_string()),
        user_agent: Some("integration-test".to_string()),
        metadata: Some(serde_json::json!({ "mfa": true, "attempt": id })),
        created_at: at(secs),
    })
}

pub struct Harness {
    pub ledger: Ledger,
    pub store: Arc<MemoryLedgerStore>,
    pub sources: Arc<MemorySourceStore>,
}

pub fn harness() -> Harness {
    harness_with(Config::default())
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let sources = Arc::new(MemorySourceStore::new());
    let ledger = Ledger::new(store.clone(), sources.clone(), config).unwrap();
    Harness {
        ledger,
        store,
        sources,
    }
}
