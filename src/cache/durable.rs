//! 结果缓存持久层（SQLite）

#![cfg(feature = "async-sqlite")]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::{CacheEntry, CacheTier};
use crate::core::StoreError;

pub struct SqliteCacheTier {
    pool: SqlitePool,
}

impl SqliteCacheTier {
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS result_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                tool TEXT
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheTier for SqliteCacheTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query("SELECT value, expires_at, tool FROM result_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.get("value");
        let expires_ms: i64 = row.get("expires_at");
        let tool: Option<String> = row.get("tool");
        let expires_at = Utc
            .timestamp_millis_opt(expires_ms)
            .single()
            .ok_or_else(|| StoreError::Serde(format!("bad expiry {expires_ms}")))?;
        Ok(Some(CacheEntry {
            key: key.to_string(),
            value: serde_json::from_str(&value)?,
            expires_at,
            tool,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO result_cache (key, value, expires_at, tool) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.key)
        .bind(entry.value.to_string())
        .bind(entry.expires_at.timestamp_millis())
        .bind(&entry.tool)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM result_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::open_pool;

    #[tokio::test]
    async fn test_sqlite_tier_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("cache.db")).await.unwrap();
        let tier = SqliteCacheTier::new(pool).await.unwrap();

        let entry = CacheEntry {
            key: "k".into(),
            value: serde_json::json!({"programs": [1, 2]}),
            expires_at: Utc.timestamp_millis_opt(1_900_000_000_000).single().unwrap(),
            tool: Some("acme_find_programs".into()),
        };
        tier.put(entry.clone()).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some(entry));

        tier.remove("k").await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), None);
    }
}
