//! 工具注册表
//!
//! 所有外部自动化工具实现 Tool trait，由 ToolRegistry 按名注册与查找；
//! ToolGateway 在调用时统一处理委托、缓存、单飞、重试与超时。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::outcome::TransportError;
use crate::mandate::Capability;

/// 工具 trait：名称、描述、执行（args 为 JSON，返回原始响应对象）
///
/// 其余方法声明网关策略：所需能力（非空即受保护）、缓存 TTL、是否开启会话、超时。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（工具边界请求中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 静态声明的所需能力；空表示不受保护
    fn required_capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// 声明 TTL 即为可缓存工具
    fn cache_ttl(&self) -> Option<chrono::Duration> {
        None
    }

    /// 建立认证会话的工具按 (subject, provider) 单飞
    fn opens_session(&self) -> bool {
        false
    }

    /// 单次尝试超时；None 使用网关默认值
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 总尝试次数上限；None 按网关的退避表
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// 执行一次；传输层失败返回 Err，业务失败体现在返回的 JSON 中
    async fn execute(&self, args: Value) -> Result<Value, TransportError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        async fn execute(&self, args: Value) -> Result<Value, TransportError> {
            Ok(args)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(Named("provider_search"));
        reg.register(Named("acme_login"));
        assert!(reg.contains("acme_login"));
        assert!(reg.get("nope").is_none());
        assert_eq!(reg.tool_names(), vec!["acme_login", "provider_search"]);
    }

    #[test]
    fn test_defaults_are_unprotected_and_uncached() {
        let tool = Named("x");
        assert!(tool.required_capabilities().is_empty());
        assert!(tool.cache_ttl().is_none());
        assert!(!tool.opens_session());
    }
}
