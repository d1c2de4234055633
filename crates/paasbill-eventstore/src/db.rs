//! SQLite pool setup and row encoding helpers
//!
//! Instants are stored as INTEGER microseconds since the Unix epoch, with a
//! NULL upper bound for open ranges. GUIDs are lowercase hyphenated TEXT and
//! decimals are TEXT so no precision is lost.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use paasbill_common::types::range::{from_micros, to_micros};
use paasbill_common::{BillingError, Result, TimeRange};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::EngineConfig;

/// Opens the connection pool, creating the database file when missing
pub async fn connect(config: &EngineConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|e| BillingError::Config(format!("invalid database url: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .connect_with(options)
        .await
        .map_err(storage_error)?;

    info!(
        max_connections = config.max_connections,
        "Connected to billing database"
    );
    Ok(pool)
}

pub(crate) fn storage_error(err: sqlx::Error) -> BillingError {
    BillingError::Storage(err.to_string())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Runs `fut` under a deadline. The future is dropped on expiry, which rolls
/// back any transaction it owns.
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BillingError::Timeout(format!(
            "{operation} did not finish within {}s",
            limit.as_secs()
        ))),
    }
}

pub(crate) fn guid_text(guid: &Uuid) -> String {
    guid.hyphenated().to_string()
}

pub(crate) fn micros(t: DateTime<Utc>) -> i64 {
    to_micros(t)
}

pub(crate) fn opt_micros(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_micros)
}

pub(crate) fn decimal_text(value: &Decimal) -> String {
    value.normalize().to_string()
}

fn decode_error(column: &str, reason: impl std::fmt::Display) -> BillingError {
    BillingError::Storage(format!("failed to decode column {column}: {reason}"))
}

pub(crate) fn get_string(row: &SqliteRow, column: &str) -> Result<String> {
    row.try_get::<String, _>(column)
        .map_err(|e| decode_error(column, e))
}

pub(crate) fn get_opt_string(row: &SqliteRow, column: &str) -> Result<Option<String>> {
    row.try_get::<Option<String>, _>(column)
        .map_err(|e| decode_error(column, e))
}

pub(crate) fn get_i64(row: &SqliteRow, column: &str) -> Result<i64> {
    row.try_get::<i64, _>(column)
        .map_err(|e| decode_error(column, e))
}

pub(crate) fn get_opt_i64(row: &SqliteRow, column: &str) -> Result<Option<i64>> {
    row.try_get::<Option<i64>, _>(column)
        .map_err(|e| decode_error(column, e))
}

pub(crate) fn get_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let text = get_string(row, column)?;
    Uuid::parse_str(&text).map_err(|e| decode_error(column, e))
}

pub(crate) fn get_opt_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
    get_opt_string(row, column)?
        .map(|text| Uuid::parse_str(&text).map_err(|e| decode_error(column, e)))
        .transpose()
}

pub(crate) fn get_instant(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let value = get_i64(row, column)?;
    from_micros(value).ok_or_else(|| decode_error(column, format!("{value} is out of range")))
}

pub(crate) fn get_opt_instant(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    get_opt_i64(row, column)?
        .map(|value| {
            from_micros(value).ok_or_else(|| decode_error(column, format!("{value} is out of range")))
        })
        .transpose()
}

pub(crate) fn get_decimal(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let text = get_string(row, column)?;
    Decimal::from_str(&text).map_err(|e| decode_error(column, e))
}

/// Reads a `<prefix>_lo` / `<prefix>_hi` column pair
pub(crate) fn get_range(row: &SqliteRow, prefix: &str) -> Result<TimeRange> {
    Ok(TimeRange {
        lo: get_instant(row, &format!("{prefix}_lo"))?,
        hi: get_opt_instant(row, &format!("{prefix}_hi"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout("sleepy", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BillingError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_row_decoding() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let guid = Uuid::new_v4();
        let row = sqlx::query(
            "SELECT ? AS guid, NULL AS missing, '0.719743892' AS rate, 1000000 AS d_lo, NULL AS d_hi",
        )
        .bind(guid_text(&guid))
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(get_uuid(&row, "guid").unwrap(), guid);
        assert_eq!(get_opt_uuid(&row, "missing").unwrap(), None);
        assert_eq!(get_decimal(&row, "rate").unwrap().to_string(), "0.719743892");
        let range = get_range(&row, "d").unwrap();
        assert_eq!(range.lo.timestamp(), 1);
        assert!(range.hi.is_none());
    }
}
