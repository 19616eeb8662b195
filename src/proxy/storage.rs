//! Durable storage backends for proxy records
//!
//! Entries are keyed by `(ip, port)`; identity narrowing by protocol list happens
//! in [`crate::proxy::ProxyStore`].

use crate::error::ProxyError;
use crate::proxy::models::{Anonymity, Protocol, StoredRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio::sync::Mutex;

/// Storage collaborator used to persist records between runs.
///
/// Implementations must be safe to call from concurrent validation batches.
#[async_trait]
pub trait ProxyStorage: Send + Sync {
    /// Insert the record or replace the entry with the same `(ip, port)`
    async fn upsert(&self, record: &StoredRecord) -> Result<(), ProxyError>;

    /// Remove the entry for `(ip, port)`, returning whether one existed
    async fn delete(&self, ip: Ipv4Addr, port: u16) -> Result<bool, ProxyError>;

    async fn list_all(&self) -> Result<Vec<StoredRecord>, ProxyError>;

    /// Remove every entry
    async fn drop_all(&self) -> Result<(), ProxyError>;
}

/// Process-local storage, useful when no database is configured
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<StoredRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyStorage for MemoryStorage {
    async fn upsert(&self, record: &StoredRecord) -> Result<(), ProxyError> {
        let mut entries = self.entries.lock().await;
        match entries
            .iter_mut()
            .find(|e| e.ip == record.ip && e.port == record.port)
        {
            Some(existing) => *existing = record.clone(),
            None => entries.push(record.clone()),
        }
        Ok(())
    }

    async fn delete(&self, ip: Ipv4Addr, port: u16) -> Result<bool, ProxyError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !(e.ip == ip && e.port == port));
        Ok(entries.len() != before)
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, ProxyError> {
        Ok(self.entries.lock().await.clone())
    }

    async fn drop_all(&self) -> Result<(), ProxyError> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    country TEXT NOT NULL,
    protocols TEXT NOT NULL,
    anonymity TEXT NOT NULL,
    total_checks INTEGER NOT NULL DEFAULT 0,
    success_checks INTEGER NOT NULL DEFAULT 0,
    judge_invalid_count INTEGER NOT NULL DEFAULT 0,
    judge_valid_count INTEGER NOT NULL DEFAULT 0,
    valid BOOLEAN NOT NULL DEFAULT 0,
    judged BOOLEAN NOT NULL DEFAULT 0,
    validation_time TEXT,
    redirects BOOLEAN NOT NULL DEFAULT 0,
    PRIMARY KEY (ip, port)
)
"#;

const UPSERT: &str = r#"
INSERT INTO proxies (
    ip, port, country, protocols, anonymity, total_checks, success_checks,
    judge_invalid_count, judge_valid_count, valid, judged, validation_time, redirects
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(ip, port) DO UPDATE SET
    country = excluded.country,
    protocols = excluded.protocols,
    anonymity = excluded.anonymity,
    total_checks = excluded.total_checks,
    success_checks = excluded.success_checks,
    judge_invalid_count = excluded.judge_invalid_count,
    judge_valid_count = excluded.judge_valid_count,
    valid = excluded.valid,
    judged = excluded.judged,
    validation_time = excluded.validation_time,
    redirects = excluded.redirects
"#;

/// SQLite-backed storage
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `database_url` and ensure the schema
    pub async fn new(database_url: &str) -> Result<Self, ProxyError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        Ok(Self { pool })
    }

    fn row_to_record(row: &SqliteRow) -> Result<StoredRecord, ProxyError> {
        let ip: String = row.try_get("ip")?;
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|e| ProxyError::InvalidArgument(format!("stored ip {:?}: {}", ip, e)))?;
        let port: i64 = row.try_get("port")?;
        let port = u16::try_from(port)
            .map_err(|_| ProxyError::InvalidArgument(format!("stored port {} out of range", port)))?;

        let protocols: String = row.try_get("protocols")?;
        let protocols = protocols
            .split(',')
            .filter(|p| !p.is_empty())
            .map(Protocol::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        let anonymity: String = row.try_get("anonymity")?;

        Ok(StoredRecord {
            ip,
            port,
            country: row.try_get("country")?,
            protocols,
            anonymity: Anonymity::parse_lenient(&anonymity),
            total_checks: count(row, "total_checks")?,
            success_checks: count(row, "success_checks")?,
            judge_invalid_count: count(row, "judge_invalid_count")?,
            judge_valid_count: count(row, "judge_valid_count")?,
            valid: row.try_get("valid")?,
            judged: row.try_get("judged")?,
            validation_time: row.try_get::<Option<DateTime<Utc>>, _>("validation_time")?,
            redirects: row.try_get("redirects")?,
        })
    }
}

fn count(row: &SqliteRow, column: &str) -> Result<u64, ProxyError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

#[async_trait]
impl ProxyStorage for SqliteStorage {
    async fn upsert(&self, record: &StoredRecord) -> Result<(), ProxyError> {
        let protocols = record
            .protocols
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(UPSERT)
            .bind(record.ip.to_string())
            .bind(record.port as i64)
            .bind(record.country.as_str())
            .bind(protocols)
            .bind(record.anonymity.to_string())
            .bind(record.total_checks as i64)
            .bind(record.success_checks as i64)
            .bind(record.judge_invalid_count as i64)
            .bind(record.judge_valid_count as i64)
            .bind(record.valid)
            .bind(record.judged)
            .bind(record.validation_time)
            .bind(record.redirects)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, ip: Ipv4Addr, port: u16) -> Result<bool, ProxyError> {
        let result = sqlx::query("DELETE FROM proxies WHERE ip = ? AND port = ?")
            .bind(ip.to_string())
            .bind(port as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, ProxyError> {
        let rows = sqlx::query("SELECT * FROM proxies ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn drop_all(&self) -> Result<(), ProxyError> {
        sqlx::query("DELETE FROM proxies").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stored(last: u8, port: u16) -> StoredRecord {
        StoredRecord {
            ip: Ipv4Addr::new(192, 168, 0, last),
            port,
            country: "NL".to_string(),
            protocols: vec![Protocol::Socks5, Protocol::Http],
            anonymity: Anonymity::Anonymous,
            total_checks: 3,
            success_checks: 2,
            judge_invalid_count: 1,
            judge_valid_count: 1,
            valid: true,
            judged: false,
            validation_time: Utc.timestamp_opt(1_700_000_000, 0).single(),
            redirects: true,
        }
    }

    async fn exercise(storage: &dyn ProxyStorage) {
        let first = stored(1, 1080);
        let second = stored(2, 1080);
        storage.upsert(&first).await.unwrap();
        storage.upsert(&second).await.unwrap();

        let mut updated = first.clone();
        updated.total_checks = 10;
        updated.anonymity = Anonymity::Elite;
        storage.upsert(&updated).await.unwrap();

        let all = storage.list_all().await.unwrap();
        assert_eq!(all, vec![updated.clone(), second.clone()]);

        assert!(storage.delete(second.ip, second.port).await.unwrap());
        assert!(!storage.delete(second.ip, second.port).await.unwrap());
        assert_eq!(storage.list_all().await.unwrap(), vec![updated]);

        storage.drop_all().await.unwrap();
        assert!(storage.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.db");
        let storage = SqliteStorage::new(path.to_str().unwrap()).await.unwrap();
        exercise(&storage).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.db");
        let path = path.to_str().unwrap();

        SqliteStorage::new(path)
            .await
            .unwrap()
            .upsert(&stored(7, 3128))
            .await
            .unwrap();

        let reopened = SqliteStorage::new(path).await.unwrap();
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, 3128);
    }
}
