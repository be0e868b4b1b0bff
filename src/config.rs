//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SIGNUP__*` 覆盖（双下划线表示嵌套，如 `SIGNUP__GATEWAY__TIMEOUT_SECS=60`）。
//! 所有字段都有默认值，没有配置文件也能启动。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::discovery::DiscoveryConfig;
use crate::flow::FlowSettings;
use crate::mandate::MandatePolicy;
use crate::tools::{GatewaySettings, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub mandate: MandateSection,
    pub gateway: GatewaySection,
    pub cache: CacheSection,
    pub discovery: DiscoveryConfig,
    pub flow: FlowSection,
    pub store: StoreSection,
    pub remote: RemoteSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 控制台模式下的默认用户
    pub default_user: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "signup-pilot".to_string(),
            default_user: None,
        }
    }
}

/// [llm] 段：仅用于润色回复，关闭时直接使用草稿文本
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub enabled: bool,
    pub model: String,
    pub base_url: Option<String>,
    /// 润色超时（秒）
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeout_secs: 5,
        }
    }
}

/// [mandate] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MandateSection {
    pub ttl_secs: i64,
    pub reuse_margin_secs: i64,
    pub default_max_amount_cents: u64,
    /// 签名密钥所在的环境变量名
    pub signing_key_env: String,
}

impl Default for MandateSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            reuse_margin_secs: 60,
            default_max_amount_cents: 0,
            signing_key_env: "SIGNUP_MANDATE_KEY".to_string(),
        }
    }
}

impl MandateSection {
    pub fn policy(&self) -> MandatePolicy {
        MandatePolicy {
            ttl: chrono::Duration::seconds(self.ttl_secs),
            reuse_margin: chrono::Duration::seconds(self.reuse_margin_secs),
            default_max_amount_cents: self.default_max_amount_cents,
        }
    }
}

/// [gateway] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// 单次尝试默认超时（秒）
    pub timeout_secs: u64,
    /// 瞬时失败后的等待时间表（毫秒），尝试次数 = 长度 + 1
    pub backoff_ms: Vec<u64>,
    pub session_token_margin_secs: i64,
    pub session_token_ttl_secs: i64,
    /// 未注册工具转发的目标
    pub fallback_tool: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            backoff_ms: vec![500, 1500],
            session_token_margin_secs: 30,
            session_token_ttl_secs: 1800,
            fallback_tool: None,
        }
    }
}

impl GatewaySection {
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            default_timeout: Duration::from_secs(self.timeout_secs),
            session_token_margin: chrono::Duration::seconds(self.session_token_margin_secs),
            session_token_ttl: chrono::Duration::seconds(self.session_token_ttl_secs),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.backoff_ms)
    }
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub memory_ttl_secs: i64,
    pub durable_ttl_secs: i64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            memory_ttl_secs: 300,
            durable_ttl_secs: 86_400,
        }
    }
}

/// [flow] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    pub max_chain: usize,
    pub max_conflict_retries: usize,
    pub max_step_retries: u32,
}

impl Default for FlowSection {
    fn default() -> Self {
        let d = FlowSettings::default();
        Self {
            max_chain: d.max_chain,
            max_conflict_retries: d.max_conflict_retries,
            max_step_retries: d.max_step_retries,
        }
    }
}

impl FlowSection {
    pub fn settings(&self) -> FlowSettings {
        FlowSettings {
            max_chain: self.max_chain,
            max_conflict_retries: self.max_conflict_retries,
            max_step_retries: self.max_step_retries,
        }
    }
}

/// [store] 段：设置 sqlite_path 时会话与缓存使用 SQLite 持久层
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub sqlite_path: Option<PathBuf>,
}

/// [remote] 段：远程工具服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub endpoint: Option<String>,
    pub providers: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            providers: Vec::new(),
            timeout_secs: 30,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SIGNUP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SIGNUP__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SIGNUP")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("gateway.backoff_ms")
            .with_list_parse_key("remote.providers")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
