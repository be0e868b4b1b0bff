//! signup-pilot - 代表用户在第三方网站完成报名的编排引擎
//!
//! 模块划分：
//! - **cache**: 两级结果缓存（内存 + SQLite），按 TTL 记忆化，未命中单飞
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、失败分类、时间源、脱敏、单飞
//! - **discovery**: 表单字段探测循环与浏览器页面抽象
//! - **flow**: 对话步骤状态机、按钮动作、步骤处理器
//! - **llm**: LLM 客户端抽象（仅用于润色回复）
//! - **mandate**: 授权委托的签发、校验与吊销
//! - **observability**: tracing 初始化
//! - **session**: 版本化会话上下文与存储
//! - **tools**: 工具注册表、远程工具与调用网关

pub mod cache;
pub mod config;
pub mod core;
pub mod discovery;
pub mod flow;
pub mod llm;
pub mod mandate;
pub mod observability;
pub mod session;
pub mod tools;

pub use flow::{FlowAction, FlowMachine, ResponseEnvelope, Step, Turn};
pub use tools::ToolGateway;
