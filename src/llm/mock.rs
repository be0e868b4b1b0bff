//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 默认回显最后一条 User 消息；也可固定回复或固定失败。

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::traits::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Clone)]
enum Behavior {
    Echo,
    Reply(String),
    Fail,
}

#[derive(Debug)]
pub struct MockLlmClient {
    behavior: Behavior,
    calls: AtomicU64,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::echo()
    }
}

impl MockLlmClient {
    pub fn echo() -> Self {
        Self {
            behavior: Behavior::Echo,
            calls: AtomicU64::new(0),
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Reply(text.into()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Fail,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.behavior {
            Behavior::Echo => Ok(messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default()),
            Behavior::Reply(text) => Ok(text.clone()),
            Behavior::Fail => Err(LlmError::Api("mock failure".to_string())),
        }
    }
}
