//! 结果缓存：内存 + 持久两级，按 TTL 失效
//!
//! - get：先查持久层（TTL 较长，默认 24h），再查内存层（TTL 较短）
//! - set：两级都写；单个条目的过期时间取「工具声明的 TTL」与「该层 TTL」中较小者；
//!   写内存层前顺带清掉已过期条目
//! - get_or_compute：未命中时同一 key 的并发调用合并为一次计算
//!
//! 缓存是建议性的：持久层读写失败只记 warn，不影响调用结果。

pub mod durable;
pub mod key;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::{Clock, SingleFlight, StoreError, ToolError};

#[cfg(feature = "async-sqlite")]
pub use durable::SqliteCacheTier;
pub use key::cache_key;

/// 缓存条目；只在 now < expires_at 时返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub expires_at: DateTime<Utc>,
    pub tool: Option<String>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// 写入元数据
#[derive(Debug, Clone, Default)]
pub struct CacheMeta {
    pub tool: Option<String>,
    /// 工具声明的 TTL；None 表示按各层默认
    pub ttl: Option<Duration>,
}

/// 缓存层接口
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// 内存层
#[derive(Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理过期条目，返回清理数量
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// 两级结果缓存
pub struct ResultCache {
    memory: MemoryTier,
    durable: Option<Arc<dyn CacheTier>>,
    memory_ttl: Duration,
    durable_ttl: Duration,
    clock: Arc<dyn Clock>,
    flight: SingleFlight<String, Result<Value, ToolError>>,
}

impl ResultCache {
    pub fn new(clock: Arc<dyn Clock>, memory_ttl: Duration, durable_ttl: Duration) -> Self {
        Self {
            memory: MemoryTier::new(),
            durable: None,
            memory_ttl,
            durable_ttl,
            clock,
            flight: SingleFlight::new(),
        }
    }

    pub fn with_durable(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.durable = Some(tier);
        self
    }

    /// 持久层优先，其次内存层
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        if let Some(durable) = &self.durable {
            match durable.get(key).await {
                Ok(Some(entry)) if entry.is_fresh(now) => return Some(entry.value),
                Ok(_) => {}
                Err(e) => tracing::warn!(key, error = %e, "durable cache read failed"),
            }
        }
        match self.memory.get(key).await {
            Ok(Some(entry)) if entry.is_fresh(now) => Some(entry.value),
            _ => None,
        }
    }

    /// 两级都写
    pub async fn set(&self, key: &str, value: Value, meta: CacheMeta) {
        let now = self.clock.now();
        let mem_ttl = meta.ttl.map_or(self.memory_ttl, |t| t.min(self.memory_ttl));
        let purged = self.memory.purge_expired(now).await;
        if purged > 0 {
            tracing::debug!(purged, "expired memory cache entries dropped");
        }
        let _ = self
            .memory
            .put(CacheEntry {
                key: key.to_string(),
                value: value.clone(),
                expires_at: now + mem_ttl,
                tool: meta.tool.clone(),
            })
            .await;

        if let Some(durable) = &self.durable {
            let durable_ttl = meta.ttl.map_or(self.durable_ttl, |t| t.min(self.durable_ttl));
            let entry = CacheEntry {
                key: key.to_string(),
                value,
                expires_at: now + durable_ttl,
                tool: meta.tool,
            };
            if let Err(e) = durable.put(entry).await {
                tracing::warn!(key, error = %e, "durable cache write failed");
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let _ = self.memory.remove(key).await;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(key).await {
                tracing::warn!(key, error = %e, "durable cache remove failed");
            }
        }
    }

    /// 命中直接返回；未命中时同 key 的并发调用只执行一次 compute，成功结果写入缓存
    ///
    /// 返回 (值, 是否命中缓存)
    pub async fn get_or_compute<F>(
        &self,
        key: &str,
        meta: CacheMeta,
        compute: F,
    ) -> (Result<Value, ToolError>, bool)
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        if let Some(hit) = self.get(key).await {
            return (Ok(hit), true);
        }
        let result = self.flight.run(key.to_string(), compute).await;
        if let Ok(ref value) = result {
            self.set(key, value.clone(), meta).await;
        }
        (result, false)
    }

    pub async fn purge_expired(&self) -> usize {
        self.memory.purge_expired(self.clock.now()).await
    }

    /// 内存层当前条目数（含尚未清理的过期条目）
    pub async fn memory_len(&self) -> usize {
        self.memory.len().await
    }

    /// 未命中计算的实际执行次数
    pub fn compute_executions(&self) -> u64 {
        self.flight.executions()
    }
}
