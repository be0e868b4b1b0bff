//! 持久化会话存储
//!
//! 使用 SQLite 存储会话上下文（整份 JSON + 版本号），支持跨重启恢复；读取时经 migrate 升级旧 schema。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::context::{migrate, SessionContext};
use super::store::SessionStore;
use crate::core::StoreError;

/// 打开（必要时创建）SQLite 数据库连接池；会话存储与结果缓存共用
pub async fn open_pool(db_path: impl AsRef<Path>) -> Result<SqlitePool, StoreError> {
    let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;
    Ok(pool)
}

/// SQLite 会话存储
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_pool(open_pool(db_path).await?).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_contexts (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stored_version(&self, session_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT version FROM session_contexts WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64).unwrap_or(0))
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>, StoreError> {
        let row = sqlx::query("SELECT version, body FROM session_contexts WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.get("version");
        let body: String = row.get("body");
        let raw: serde_json::Value = serde_json::from_str(&body)?;
        let mut ctx = migrate(raw)?;
        ctx.version = version as u64;
        if ctx.session_id.is_empty() {
            ctx.session_id = session_id.to_string();
        }
        Ok(Some(ctx))
    }

    async fn set(&self, ctx: &SessionContext) -> Result<u64, StoreError> {
        let next = ctx.version + 1;
        let mut stored = ctx.clone();
        stored.version = next;
        let body = serde_json::to_string(&stored)?;
        let updated_at = stored.updated_at.to_rfc3339();

        let affected = if ctx.version == 0 {
            sqlx::query(
                "INSERT INTO session_contexts (id, version, schema_version, body, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&ctx.session_id)
            .bind(next as i64)
            .bind(stored.schema_version as i64)
            .bind(&body)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE session_contexts
                 SET version = ?, schema_version = ?, body = ?, updated_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(next as i64)
            .bind(stored.schema_version as i64)
            .bind(&body)
            .bind(&updated_at)
            .bind(&ctx.session_id)
            .bind(ctx.version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 1 {
            Ok(next)
        } else {
            Err(StoreError::Conflict {
                key: ctx.session_id.clone(),
                expected: ctx.version,
                found: self.stored_version(&ctx.session_id).await?,
            })
        }
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_contexts WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
