//! discover_fields 工具：打开表单页面并运行探测循环
//!
//! 受保护（需要 discover_fields 能力），可缓存，超时较长，只尝试一次：
//! 一次探测可能耗时数分钟，失败后由用户决定是否重来。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::engine::{DiscoveryConfig, DiscoveryEngine};
use super::surface::SurfaceFactory;
use crate::core::SurfaceError;
use crate::mandate::Capability;
use crate::tools::{Tool, TransportError};

pub const DISCOVERY_TOOL: &str = "discover_fields";

pub struct DiscoveryTool {
    factory: Arc<dyn SurfaceFactory>,
    engine: DiscoveryEngine,
}

impl DiscoveryTool {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: DiscoveryConfig) -> Self {
        Self {
            factory,
            engine: DiscoveryEngine::new(config),
        }
    }

    /// 参数中的 url 优先，其次按模板拼出
    fn form_url(&self, args: &Value) -> Option<String> {
        if let Some(url) = args.get("url").and_then(Value::as_str).filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        let template = self.engine.config().form_url_template.as_ref()?;
        let provider = args.get("provider").and_then(Value::as_str).unwrap_or_default();
        let org_ref = args.get("org_ref").and_then(Value::as_str).unwrap_or(provider);
        Some(template.replace("{provider}", provider).replace("{org_ref}", org_ref))
    }
}

#[async_trait]
impl Tool for DiscoveryTool {
    fn name(&self) -> &str {
        DISCOVERY_TOOL
    }

    fn description(&self) -> &str {
        "Learn a signup form's required fields by filling it with synthetic values and reading validation errors"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::DiscoverFields]
    }

    fn cache_ttl(&self) -> Option<chrono::Duration> {
        Some(chrono::Duration::seconds(self.engine.config().cache_ttl_secs))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.engine.config().timeout_secs))
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }

    async fn execute(&self, args: Value) -> Result<Value, TransportError> {
        let Some(url) = self.form_url(&args) else {
            return Ok(json!({
                "success": false,
                "error": "No signup form address is known for this provider",
            }));
        };
        tracing::info!(url = %url, "field discovery started");

        let surface = self.factory.open(&url).await.map_err(to_transport)?;
        let run = self.engine.run(surface.as_ref()).await.map_err(to_transport)?;
        Ok(json!({
            "success": true,
            "fields": run.fields,
            "confidence": run.confidence,
            "loops": run.loops,
            "termination": run.termination,
            "metadata": run.metadata,
        }))
    }
}

fn to_transport(e: SurfaceError) -> TransportError {
    TransportError::Network(e.to_string())
}
