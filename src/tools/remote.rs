//! 远程工具：把 `{tool, args}` POST 到自动化服务端点，返回响应对象
//!
//! HTTP 状态码与网络错误映射为 TransportError，响应体里的业务失败交给网关分类。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::catalog::Operation;
use super::outcome::TransportError;
use super::registry::{Tool, ToolRegistry};
use crate::mandate::Capability;

const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct RemoteTool {
    client: Client,
    endpoint: String,
    name: String,
    description: String,
    operation: Operation,
}

impl RemoteTool {
    pub fn new(client: Client, endpoint: impl Into<String>, provider: &str, operation: Operation) -> Self {
        let name = operation.tool_name(provider);
        let description = format!("{} via remote automation for {}", operation.suffix(), provider);
        Self {
            client,
            endpoint: endpoint.into(),
            name,
            description,
            operation,
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        self.operation.required_capabilities()
    }

    fn cache_ttl(&self) -> Option<chrono::Duration> {
        self.operation.cache_ttl()
    }

    fn opens_session(&self) -> bool {
        self.operation.opens_session()
    }

    async fn execute(&self, args: Value) -> Result<Value, TransportError> {
        let body = serde_json::json!({ "tool": self.name, "args": args });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            // 非 2xx 但带了结构化失败体时，交给网关按响应分类
            let business_status = status.is_client_error() && !matches!(status.as_u16(), 401 | 403 | 429);
            if business_status {
                if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&text) {
                    if v.get("error").is_some_and(|e| !e.is_null()) {
                        return Ok(v);
                    }
                }
            }
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Other(format!("invalid JSON response: {e}")))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

/// 为每个 provider 注册全部操作，外加 provider_search
pub fn register_remote_tools(
    registry: &mut ToolRegistry,
    endpoint: &str,
    providers: &[String],
    timeout: Duration,
) -> Result<(), reqwest::Error> {
    let client = Client::builder().timeout(timeout).build()?;
    registry.register(RemoteTool::new(client.clone(), endpoint, "", Operation::ProviderSearch));
    for provider in providers {
        for op in Operation::PROVIDER_SCOPED {
            registry.register(RemoteTool::new(client.clone(), endpoint, provider, op));
        }
    }
    tracing::info!(endpoint, providers = providers.len(), "remote tools registered");
    Ok(())
}
