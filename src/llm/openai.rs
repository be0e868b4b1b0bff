//! OpenAI 兼容端点上的润色客户端
//!
//! 只发 system + user 两类消息；温度低、输出短，避免改写时加入新内容。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use super::traits::{LlmClient, LlmError, Message, Role};

const TEMPERATURE: f32 = 0.3;
const MAX_COMPLETION_TOKENS: u32 = 400;

fn api_error(e: OpenAIError) -> LlmError {
    LlmError::Api(e.to_string())
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    /// api_key 缺省时读取 `OPENAI_API_KEY`
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = match api_key {
            Some(k) => k.to_string(),
            None => std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        };
        let mut config = OpenAIConfig::new().with_api_key(key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn request_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
        let msg: ChatCompletionRequestMessage = match m.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.as_str())
                .build()
                .map_err(api_error)?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.as_str())
                .build()
                .map_err(api_error)?
                .into(),
        };
        Ok(msg)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let messages = messages
            .iter()
            .map(Self::request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .temperature(TEMPERATURE)
            .max_completion_tokens(MAX_COMPLETION_TOKENS)
            .messages(messages)
            .build()
            .map_err(api_error)?;

        let response = self.client.chat().create(request).await.map_err(api_error)?;
        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "polish completion"
            );
        }

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_map_to_request_messages() {
        let system = OpenAiClient::request_message(&Message::system("rewrite")).unwrap();
        assert!(matches!(system, ChatCompletionRequestMessage::System(_)));
        let user = OpenAiClient::request_message(&Message::user("hello")).unwrap();
        assert!(matches!(user, ChatCompletionRequestMessage::User(_)));
    }
}
