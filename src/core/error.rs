//! 错误类型与恢复动作
//!
//! 每层一个错误枚举：授权委托（AuthzError）、工具网关（ToolError）、持久化（StoreError）、
//! 步骤处理（FlowError）。ToolError 需要 Clone，单飞（single-flight）合并的调用方共享同一个结果。
//! 与 RecoveryEngine 配合：根据 FlowError 决定 Retry / Reconnect / ChooseAnotherProgram 等。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::FailureKind;

/// 授权委托相关错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("Missing subject: cannot issue a mandate without a user")]
    MissingSubject,

    #[error("Missing provider: cannot issue a mandate without a provider")]
    MissingProvider,

    #[error("Mandate signature mismatch")]
    BadSignature,

    #[error("Mandate scope does not cover: {0}")]
    InsufficientScope(String),

    #[error("Mandate outside validity window")]
    Expired,

    #[error("Mandate revoked")]
    Revoked,

    #[error("Mandate not known to this authority")]
    UnknownMandate,

    #[error("Mandate signing failed: {0}")]
    Signing(String),
}

/// 工具网关错误（已分类，重试结束后的最终结果）
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// 未注册的工具：从不重试
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 超时 / 网络 / 5xx，重试耗尽
    #[error("Tool {tool} failed after {attempts} attempts: {detail}")]
    Transient {
        tool: String,
        attempts: u32,
        detail: String,
    },

    /// 下游拒绝授权（刷新委托后仍失败，或未受保护工具收到该信号）
    #[error("Tool {tool} authorization failed: {detail}")]
    Authorization { tool: String, detail: String },

    /// 业务失败：传输成功但响应含 error 或 success:false
    #[error("Tool {tool} reported {kind:?}: {message}")]
    Business {
        tool: String,
        kind: FailureKind,
        message: String,
    },

    #[error(transparent)]
    Authz(#[from] AuthzError),
}

impl ToolError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ToolError::UnknownTool(_) => FailureKind::Unknown,
            ToolError::Transient { .. } => FailureKind::NetworkTimeout,
            ToolError::Authorization { .. } | ToolError::Authz(_) => FailureKind::AuthorizationFailed,
            ToolError::Business { kind, .. } => *kind,
        }
    }
}

/// 持久化错误
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// 乐观并发冲突：写入时版本号与存储中的不一致
    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serde(String),

    #[error("Unsupported schema version: {0}")]
    UnsupportedSchema(u32),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// 表单页面（浏览器）操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// 元素在两次操作之间从页面上消失
    #[error("Element no longer present: {0}")]
    Detached(String),

    #[error("Browser backend error: {0}")]
    Backend(String),
}

/// 步骤处理错误
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// 工具返回的数据结构不符合预期
    #[error("Malformed tool response from {tool}: {detail}")]
    MalformedResponse { tool: String, detail: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 原样重试当前步骤
    Retry,
    /// 重新连接账号（凭据失效、验证码、授权反复失败）
    Reconnect,
    UpdatePayment,
    ChooseAnotherProgram,
    ReviewForm,
    ContactSupport,
}
