//! 引擎构建器：按配置组装会话存储、结果缓存、委托签发方、工具网关与流程状态机
//!
//! 控制台入口与集成测试共用同一套组装逻辑；测试可注入时钟、页面工厂与额外工具。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::ResultCache;
use crate::config::AppConfig;
use crate::core::{Clock, StoreError, SystemClock};
use crate::discovery::{DiscoveryTool, SurfaceFactory};
use crate::flow::{FlowMachine, Narrator, StepHandlers};
use crate::llm::{LlmClient, OpenAiClient};
use crate::mandate::{HmacSigner, MandateAuthority, MandateSigner};
use crate::session::{MemorySessionStore, SessionStore};
use crate::tools::{register_remote_tools, Tool, ToolGateway, ToolRegistry};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("remote tool client: {0}")]
    Remote(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 组装完成的引擎
pub struct Engine {
    pub machine: FlowMachine,
    pub gateway: Arc<ToolGateway>,
    pub store: Arc<dyn SessionStore>,
}

pub struct EngineBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn MandateSigner>>,
    surfaces: Option<Arc<dyn SurfaceFactory>>,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn SessionStore>>,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            signer: None,
            surfaces: None,
            llm: None,
            store: None,
            extra_tools: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn MandateSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// 表单页面工厂；未设置且启用 browser feature 时使用 headless Chrome
    pub fn with_surfaces(mut self, surfaces: Arc<dyn SurfaceFactory>) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 额外注册的工具（同名时覆盖远程工具）
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_registry(&mut self) -> Result<ToolRegistry, BuildError> {
        let mut registry = ToolRegistry::new();
        if let Some(endpoint) = &self.config.remote.endpoint {
            register_remote_tools(
                &mut registry,
                endpoint,
                &self.config.remote.providers,
                Duration::from_secs(self.config.remote.timeout_secs),
            )?;
        }

        match self.surfaces.take().or_else(default_surfaces) {
            Some(surfaces) => {
                registry.register(DiscoveryTool::new(surfaces, self.config.discovery.clone()));
            }
            None => tracing::warn!("no form surface available, field discovery disabled"),
        }

        for tool in self.extra_tools.drain(..) {
            registry.register_arc(tool);
        }
        Ok(registry)
    }

    fn build_narrator(&self) -> Narrator {
        let timeout = Duration::from_secs(self.config.llm.timeout_secs);
        if let Some(llm) = &self.llm {
            return Narrator::new(llm.clone(), timeout);
        }
        if self.config.llm.enabled {
            let llm = OpenAiClient::new(self.config.llm.base_url.as_deref(), &self.config.llm.model, None);
            return Narrator::new(Arc::new(llm), timeout);
        }
        Narrator::plain()
    }

    /// 会话存储与缓存持久层共用一个 SQLite 连接池
    async fn build_storage(&mut self) -> Result<(Arc<dyn SessionStore>, ResultCache), BuildError> {
        let cache = ResultCache::new(
            self.clock.clone(),
            chrono::Duration::seconds(self.config.cache.memory_ttl_secs),
            chrono::Duration::seconds(self.config.cache.durable_ttl_secs),
        );

        #[cfg(feature = "async-sqlite")]
        if let Some(path) = self.config.store.sqlite_path.clone() {
            use crate::cache::durable::SqliteCacheTier;
            use crate::session::{open_pool, SqliteSessionStore, TieredSessionStore};

            let pool = open_pool(&path).await?;
            let tier = SqliteCacheTier::new(pool.clone()).await?;
            let store: Arc<dyn SessionStore> = match self.store.take() {
                Some(store) => store,
                None => Arc::new(TieredSessionStore::new(Arc::new(SqliteSessionStore::with_pool(pool).await?))),
            };
            tracing::info!(path = %path.display(), "using sqlite persistence");
            return Ok((store, cache.with_durable(Arc::new(tier))));
        }

        #[cfg(not(feature = "async-sqlite"))]
        if self.config.store.sqlite_path.is_some() {
            tracing::warn!("sqlite_path set but async-sqlite feature not enabled, using memory");
        }

        let store = self
            .store
            .take()
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        Ok((store, cache))
    }

    pub async fn build(mut self) -> Result<Engine, BuildError> {
        let registry = self.build_registry()?;
        let (store, cache) = self.build_storage().await?;

        let signer = self
            .signer
            .take()
            .unwrap_or_else(|| Arc::new(HmacSigner::from_env(&self.config.mandate.signing_key_env)));
        let authority = Arc::new(MandateAuthority::new(
            signer,
            self.clock.clone(),
            self.config.mandate.policy(),
        ));

        let mut gateway = ToolGateway::new(registry, authority, Arc::new(cache), self.clock.clone())
            .with_retry(self.config.gateway.retry())
            .with_settings(self.config.gateway.settings());
        if let Some(fallback) = &self.config.gateway.fallback_tool {
            gateway = gateway.with_fallback(fallback.clone());
        }
        let gateway = Arc::new(gateway);
        tracing::info!(tools = ?gateway.registry().tool_names(), "tool gateway ready");

        let machine = FlowMachine::new(
            store.clone(),
            StepHandlers::new(gateway.clone(), self.clock.clone()),
            self.clock.clone(),
        )
        .with_narrator(self.build_narrator())
        .with_settings(self.config.flow.settings());

        Ok(Engine {
            machine,
            gateway,
            store,
        })
    }
}

#[cfg(feature = "browser")]
fn default_surfaces() -> Option<Arc<dyn SurfaceFactory>> {
    Some(Arc::new(crate::discovery::ChromeSurfaceFactory::new()))
}

#[cfg(not(feature = "browser"))]
fn default_surfaces() -> Option<Arc<dyn SurfaceFactory>> {
    None
}
