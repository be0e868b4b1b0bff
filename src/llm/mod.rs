//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），仅用于润色回复文本

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError, Message, Role};
