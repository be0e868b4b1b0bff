//! 会话存储抽象层
//!
//! 定义统一的会话上下文存取接口（get / set / delete），支持内存、持久化与两级组合三种实现。
//! 写入带乐观并发检查：`ctx.version` 必须等于存储中的版本（新会话为 0），否则返回 Conflict。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::context::SessionContext;
use crate::core::StoreError;

#[cfg(feature = "async-sqlite")]
use super::persistent::SqliteSessionStore;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话上下文
    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>, StoreError>;

    /// 写入会话上下文，返回写入后的版本号
    async fn set(&self, ctx: &SessionContext) -> Result<u64, StoreError>;

    /// 删除会话上下文
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    contexts: RwLock<HashMap<String, SessionContext>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 不做版本检查直接覆盖（两级存储回填内存层时使用）
    async fn put_unchecked(&self, ctx: SessionContext) {
        self.contexts.write().await.insert(ctx.session_id.clone(), ctx);
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>, StoreError> {
        Ok(self.contexts.read().await.get(session_id).cloned())
    }

    async fn set(&self, ctx: &SessionContext) -> Result<u64, StoreError> {
        let mut contexts = self.contexts.write().await;
        let found = contexts.get(&ctx.session_id).map(|c| c.version).unwrap_or(0);
        if found != ctx.version {
            return Err(StoreError::Conflict {
                key: ctx.session_id.clone(),
                expected: ctx.version,
                found,
            });
        }
        let mut stored = ctx.clone();
        stored.version = found + 1;
        let version = stored.version;
        contexts.insert(stored.session_id.clone(), stored);
        Ok(version)
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.contexts.write().await.remove(session_id);
        Ok(())
    }
}

/// 两级会话存储：内存快路径 + 持久层兜底
///
/// 读：先内存，未命中再读持久层并回填；写：持久层为准（版本检查在持久层），成功后覆盖内存。
pub struct TieredSessionStore {
    memory: MemorySessionStore,
    durable: Arc<dyn SessionStore>,
}

impl TieredSessionStore {
    pub fn new(durable: Arc<dyn SessionStore>) -> Self {
        Self {
            memory: MemorySessionStore::new(),
            durable,
        }
    }
}

#[async_trait]
impl SessionStore for TieredSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>, StoreError> {
        if let Some(ctx) = self.memory.get(session_id).await? {
            return Ok(Some(ctx));
        }
        let loaded = self.durable.get(session_id).await?;
        if let Some(ref ctx) = loaded {
            self.memory.put_unchecked(ctx.clone()).await;
        }
        Ok(loaded)
    }

    async fn set(&self, ctx: &SessionContext) -> Result<u64, StoreError> {
        match self.durable.set(ctx).await {
            Ok(version) => {
                let mut cached = ctx.clone();
                cached.version = version;
                self.memory.put_unchecked(cached).await;
                Ok(version)
            }
            Err(e) => {
                // 内存层可能已过时，丢弃以便下次从持久层重读
                let _ = self.memory.delete(&ctx.session_id).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.memory.delete(session_id).await?;
        self.durable.delete(session_id).await
    }
}

/// 创建会话存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用「内存 + SQLite」两级存储；否则使用内存存储
pub async fn create_session_store(db_path: Option<&std::path::Path>) -> Arc<dyn SessionStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteSessionStore::open(path).await {
            Ok(store) => {
                tracing::info!("Using tiered session store backed by {:?}", path);
                return Arc::new(TieredSessionStore::new(Arc::new(store)));
            }
            Err(e) => {
                tracing::warn!("Failed to open persistent session store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent session store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new())
}
