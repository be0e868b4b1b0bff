//! 回复润色
//!
//! 处理器给出草稿文本，LLM 只负责改写措辞；任何失败（错误、超时、空输出）都原样返回草稿。

use std::sync::Arc;
use std::time::Duration;

use super::step::Step;
use crate::llm::{LlmClient, Message};

const SYSTEM_PROMPT: &str = "You rewrite messages from a signup assistant so they read warm and concise. \
Keep every fact, name, number and confirmation code exactly as given. \
Do not add questions or promises. Reply with the rewritten message only.";

pub struct Narrator {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl Narrator {
    /// 不润色，直接使用草稿
    pub fn plain() -> Self {
        Self {
            llm: None,
            timeout: Duration::from_secs(0),
        }
    }

    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self {
            llm: Some(llm),
            timeout,
        }
    }

    pub async fn polish(&self, step: Step, draft: &str) -> String {
        let Some(llm) = &self.llm else {
            return draft.to_string();
        };
        if draft.trim().is_empty() {
            return draft.to_string();
        }

        let messages = [
            Message::system(SYSTEM_PROMPT),
            Message::user(format!("Step: {step}\nMessage: {draft}")),
        ];
        match tokio::time::timeout(self.timeout, llm.complete(&messages)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) => {
                tracing::warn!(step = %step, "narrator returned empty text, using draft");
                draft.to_string()
            }
            Ok(Err(e)) => {
                tracing::warn!(step = %step, error = %e, "narrator failed, using draft");
                draft.to_string()
            }
            Err(_) => {
                tracing::warn!(step = %step, "narrator timed out, using draft");
                draft.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_failure_falls_back_to_draft() {
        let n = Narrator::new(Arc::new(MockLlmClient::failing()), Duration::from_secs(1));
        assert_eq!(n.polish(Step::Login, "Signed in.").await, "Signed in.");
    }

    #[tokio::test]
    async fn test_polished_text_is_used() {
        let n = Narrator::new(Arc::new(MockLlmClient::reply("All signed in!")), Duration::from_secs(1));
        assert_eq!(n.polish(Step::Login, "Signed in.").await, "All signed in!");

        let n = Narrator::new(Arc::new(MockLlmClient::reply("   ")), Duration::from_secs(1));
        assert_eq!(n.polish(Step::Login, "Signed in.").await, "Signed in.");
    }

    #[tokio::test]
    async fn test_plain_never_calls_llm() {
        assert_eq!(Narrator::plain().polish(Step::Completed, "Done.").await, "Done.");
    }
}
