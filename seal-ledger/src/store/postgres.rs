//! Relational store on PostgreSQL
//!
//! Reads the source tables and writes their back-pointer columns. Pointer
//! column names used by the reconciler come from `information_schema`, never
//! from callers, and are quoted before they reach SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

use super::{MissingPointers, SourceStore};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::reconciler::{PointerMapping, PointerRole, PointerValue, RelinkCandidate, ValueKind};
use crate::types::{
    BackPointer, PointedRow, RowPointers, SecurityLogRow, Source, SourceRow, TradeFillRow,
    WalletTransactionRow,
};

/// Postgres connection pool
pub type DbPool = Pool<Postgres>;

/// Rows per back-pointer UPDATE
const POINTER_CHUNK: usize = 200;

const WALLET_COLUMNS: &str = "id::bigint AS id, user_id::text AS user_id, type::text AS tx_type, \
     amount, balance_after, description, reference_id::text AS reference_id, status::text AS status, \
     created_at";

const TRADE_COLUMNS: &str = "id::bigint AS id, user_id::text AS user_id, side::text AS side, \
     symbol, qty, price, gross_quote, fee_quote, net_quote, wallet_tx_id::bigint AS wallet_tx_id, \
     reference_id::text AS reference_id, request_id::text AS request_id, status::text AS status, \
     created_at";

const SECURITY_COLUMNS: &str = "id::bigint AS id, user_id::text AS user_id, \
     event_type::text AS event_type, ip::text AS ip, user_agent, metadata::jsonb AS metadata, \
     created_at";

const POINTER_COLUMNS: &str = "ledger_block_height::bigint AS ledger_block_height, \
     ledger_block_hash::text AS ledger_block_hash, ledger_commit_key::text AS ledger_commit_key, \
     ledger_item_idx::bigint AS ledger_item_idx, ledger_committed_at";

fn columns_of(source: Source) -> &'static str {
    match source {
        Source::WalletTransactions => WALLET_COLUMNS,
        Source::TradeFills => TRADE_COLUMNS,
        Source::SecurityLogs => SECURITY_COLUMNS,
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn cast(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Integer => "::bigint",
        ValueKind::Text => "::text",
        ValueKind::Timestamp => "",
    }
}

fn decode_row(source: Source, row: &PgRow) -> Result<SourceRow> {
    Ok(match source {
        Source::WalletTransactions => SourceRow::Wallet(WalletTransactionRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            tx_type: row.try_get("tx_type")?,
            amount: row.try_get("amount")?,
            balance_after: row.try_get("balance_after")?,
            description: row.try_get("description")?,
            reference_id: row.try_get("reference_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        }),
        Source::TradeFills => SourceRow::Trade(TradeFillRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            side: row.try_get("side")?,
            symbol: row.try_get("symbol")?,
            qty: row.try_get("qty")?,
            price: row.try_get("price")?,
            gross_quote: row.try_get("gross_quote")?,
            fee_quote: row.try_get("fee_quote")?,
            net_quote: row.try_get("net_quote")?,
            wallet_tx_id: row.try_get("wallet_tx_id")?,
            reference_id: row.try_get("reference_id")?,
            request_id: row.try_get("request_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        }),
        Source::SecurityLogs => SourceRow::Security(SecurityLogRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            ip: row.try_get("ip")?,
            user_agent: row.try_get("user_agent")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        }),
    })
}

fn decode_pointers(row: &PgRow) -> Result<RowPointers> {
    let height: Option<i64> = row.try_get("ledger_block_height")?;
    let idx: Option<i64> = row.try_get("ledger_item_idx")?;
    Ok(RowPointers {
        height: height.and_then(|h| u64::try_from(h).ok()),
        block_hash: row.try_get("ledger_block_hash")?,
        commit_key: row.try_get("ledger_commit_key")?,
        item_idx: idx.and_then(|i| u32::try_from(i).ok()),
        committed_at: row.try_get("ledger_committed_at")?,
    })
}

fn decode_value(row: &PgRow, column: &str, kind: ValueKind) -> Result<Option<PointerValue>> {
    Ok(match kind {
        ValueKind::Integer => row
            .try_get::<Option<i64>, _>(column)?
            .map(PointerValue::Integer),
        ValueKind::Text => row
            .try_get::<Option<String>, _>(column)?
            .map(PointerValue::Text),
        ValueKind::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(column)?
            .map(PointerValue::Timestamp),
    })
}

/// `a IS NULL OR b IS NULL ...` over the given columns
fn any_unset<'a>(alias: &str, columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|c| format!("{}.{} IS NULL", alias, quote(c)))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Relational store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: DbPool,
}

impl PgSourceStore {
    /// Wrap an existing pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect and verify the pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        info!("Database connection verified");

        Ok(Self { pool })
    }

    /// Underlying pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn fetch_after(
        &self,
        source: Source,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id > $1 ORDER BY id ASC LIMIT $2",
            columns_of(source),
            source.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| decode_row(source, row)).collect()
    }

    async fn write_back_pointers(
        &self,
        source: Source,
        pointer: &BackPointer,
        rows: &[(i64, u32)],
    ) -> Result<u64> {
        let height = i64::try_from(pointer.height)
            .map_err(|_| Error::Validation(format!("height {} out of range", pointer.height)))?;
        let sql = format!(
            "UPDATE {} AS t SET ledger_block_height = $1, ledger_block_hash = $2, \
             ledger_commit_key = $3, ledger_item_idx = v.idx, ledger_committed_at = $4 \
             FROM UNNEST($5::bigint[], $6::int[]) AS v(id, idx) \
             WHERE t.id = v.id AND t.ledger_block_height IS NULL",
            source.as_str()
        );

        let mut updated = 0;
        for chunk in rows.chunks(POINTER_CHUNK) {
            let ids: Vec<i64> = chunk.iter().map(|(id, _)| *id).collect();
            let idxs: Vec<i32> = chunk
                .iter()
                .map(|(_, idx)| i32::try_from(*idx).unwrap_or(i32::MAX))
                .collect();
            let result = sqlx::query(&sql)
                .bind(height)
                .bind(&pointer.block_hash)
                .bind(&pointer.commit_key)
                .bind(pointer.committed_at)
                .bind(ids)
                .bind(idxs)
                .execute(&self.pool)
                .await?;
            updated += result.rows_affected();
        }
        Ok(updated)
    }

    async fn find_row(&self, source: Source, id: i64) -> Result<Option<PointedRow>> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE id = $1",
            columns_of(source),
            POINTER_COLUMNS,
            source.as_str()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(PointedRow {
                row: decode_row(source, &row)?,
                pointers: decode_pointers(&row)?,
            })),
            None => Ok(None),
        }
    }

    async fn table_columns(&self, table: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("column_name").map_err(Error::from))
            .collect()
    }

    async fn relink_candidates(
        &self,
        mapping: &PointerMapping,
        limit: usize,
    ) -> Result<Vec<RelinkCandidate>> {
        let Some(height) = mapping.pair(PointerRole::BlockHeight) else {
            return Ok(Vec::new());
        };

        let mut select = vec![
            "tf.id::bigint AS dst_id".to_string(),
            "wt.id::bigint AS src_id".to_string(),
        ];
        for (i, pair) in mapping.pairs.iter().enumerate() {
            select.push(format!(
                "wt.{}{} AS v{}",
                quote(&pair.origin),
                cast(pair.role.kind()),
                i
            ));
        }
        let sql = format!(
            "SELECT {} FROM trade_fills tf \
             JOIN wallet_transactions wt ON wt.reference_id = tf.reference_id \
             WHERE tf.status <> 'REVERSED' AND wt.{} IS NOT NULL AND ({}) \
             ORDER BY tf.id ASC LIMIT $1",
            select.join(", "),
            quote(&height.origin),
            any_unset("tf", mapping.pairs.iter().map(|p| p.destination.as_str())),
        );

        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<RelinkCandidate> {
                let values = mapping
                    .pairs
                    .iter()
                    .enumerate()
                    .map(|(i, pair)| decode_value(row, &format!("v{}", i), pair.role.kind()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(RelinkCandidate {
                    destination_id: row.try_get("dst_id")?,
                    origin_id: row.try_get("src_id")?,
                    values,
                })
            })
            .collect()
    }

    async fn apply_relink(
        &self,
        mapping: &PointerMapping,
        candidate: &RelinkCandidate,
    ) -> Result<u64> {
        let mut sets = Vec::new();
        let mut binds = Vec::new();
        for (pair, value) in mapping.pairs.iter().zip(&candidate.values) {
            if let Some(value) = value {
                binds.push(value);
                let column = quote(&pair.destination);
                sets.push(format!("{0} = COALESCE({0}, ${1})", column, binds.len()));
            }
        }
        if sets.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE trade_fills AS tf SET {} WHERE tf.id = ${} AND ({})",
            sets.join(", "),
            binds.len() + 1,
            any_unset("tf", mapping.pairs.iter().map(|p| p.destination.as_str())),
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = match value {
                PointerValue::Integer(v) => query.bind(*v),
                PointerValue::Text(v) => query.bind(v.clone()),
                PointerValue::Timestamp(v) => query.bind(*v),
            };
        }
        let result = query
            .bind(candidate.destination_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn missing_wallet_pointers(
        &self,
        mapping: &PointerMapping,
        sample: usize,
    ) -> Result<MissingPointers> {
        if mapping.pairs.is_empty() {
            return Ok(MissingPointers::default());
        }
        let unset = any_unset("wt", mapping.pairs.iter().map(|p| p.origin.as_str()));

        let count_sql = format!(
            "SELECT COUNT(*)::bigint AS n FROM wallet_transactions wt \
             WHERE wt.status = 'CONFIRMED' AND ({})",
            unset
        );
        let total: i64 = sqlx::query(&count_sql)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let sample_sql = format!(
            "SELECT wt.id::bigint AS id FROM wallet_transactions wt \
             WHERE wt.status = 'CONFIRMED' AND ({}) ORDER BY wt.id ASC LIMIT $1",
            unset
        );
        let rows = sqlx::query(&sample_sql)
            .bind(sample as i64)
            .fetch_all(&self.pool)
            .await?;
        let sample = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;

        Ok(MissingPointers {
            total: total.max(0) as u64,
            sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("ledger_block_height"), "\"ledger_block_height\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_any_unset() {
        let sql = any_unset("tf", ["a", "b"].into_iter());
        assert_eq!(sql, "tf.\"a\" IS NULL OR tf.\"b\" IS NULL");
    }

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_database_connection() {
        let config = DatabaseConfig::default();
        let store = PgSourceStore::connect(&config).await.unwrap();
        let columns = store.table_columns("wallet_transactions").await.unwrap();
        assert!(columns.contains("id"));
    }
}
