//! LLM 客户端抽象
//!
//! 只用于润色回复文本：输入消息列表，输出一段文本。所有后端（OpenAI 兼容 / Mock）实现 LlmClient。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Api(String),

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM returned an empty completion")]
    Empty,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;
}
