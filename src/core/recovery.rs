//! 错误恢复引擎
//!
//! 根据 FlowError 给出面向用户的说明与 RecoveryAction，流程机据此生成按钮。
//! 内部细节只写日志（先脱敏），不进入用户可见文本。

use crate::core::sanitize::sanitize_detail;
use crate::core::{FailureKind, FlowError, RecoveryAction, ToolError};

const GENERIC_APOLOGY: &str = "Sorry, something went wrong on my end. Let's try that again.";

/// 一次失败的恢复建议
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub action: RecoveryAction,
    pub message: String,
    pub kind: FailureKind,
}

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &FlowError) -> Recovery {
        tracing::warn!(error = %sanitize_detail(&err.to_string()), "step failed");
        match err {
            FlowError::Tool(e) => Self::from_tool(e),
            FlowError::Authz(_) => Self::from_kind(FailureKind::AuthorizationFailed),
            FlowError::Store(_) | FlowError::MalformedResponse { .. } | FlowError::Internal(_) => {
                Recovery {
                    action: RecoveryAction::Retry,
                    message: GENERIC_APOLOGY.to_string(),
                    kind: FailureKind::Unknown,
                }
            }
        }
    }

    fn from_tool(err: &ToolError) -> Recovery {
        match err {
            ToolError::UnknownTool(_) => Recovery {
                action: RecoveryAction::ContactSupport,
                message: "I can't do that with this provider yet.".to_string(),
                kind: FailureKind::Unknown,
            },
            ToolError::Transient { .. } => Self::from_kind(FailureKind::NetworkTimeout),
            ToolError::Authorization { .. } | ToolError::Authz(_) => {
                Self::from_kind(FailureKind::AuthorizationFailed)
            }
            ToolError::Business { kind, .. } => Self::from_kind(*kind),
        }
    }

    fn from_kind(kind: FailureKind) -> Recovery {
        Recovery {
            action: kind.recovery(),
            message: kind.user_message().to_string(),
            kind,
        }
    }
}
