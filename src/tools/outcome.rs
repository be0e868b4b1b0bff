//! 调用结果分类
//!
//! 工具边界约定：响应对象中存在 `error` 或 `success: false` 即为失败，与传输状态无关。
//! 传输层失败（超时、网络、HTTP 状态码）单独分类：5xx / 429 / 超时可重试，401 / 403 为授权失败。

use serde_json::Value;
use thiserror::Error;

use crate::core::failure::FailureKind;

/// 传输层失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// 单次尝试的分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    /// 可重试
    Transient(String),
    /// 下游拒绝授权：刷新委托后重试一次
    Authorization(String),
    /// 业务失败：不重试
    Business { kind: FailureKind, message: String },
}

/// 分类工具返回的响应对象
pub fn classify_response(value: Value) -> Outcome {
    let error = value.get("error").filter(|e| !e.is_null());
    let explicit_failure = value.get("success").and_then(Value::as_bool) == Some(false);
    if error.is_none() && !explicit_failure {
        return Outcome::Success(value);
    }

    let message = match error {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("operation reported success: false")
            .to_string(),
    };
    let code = value
        .get("code")
        .or_else(|| error.and_then(|e| e.get("code")))
        .and_then(Value::as_str);

    from_kind(FailureKind::classify(code, &message), message)
}

/// 分类传输层失败
pub fn classify_transport(err: &TransportError) -> Outcome {
    match err {
        TransportError::Timeout => Outcome::Transient("timed out".to_string()),
        TransportError::Network(detail) => Outcome::Transient(detail.clone()),
        TransportError::Status { status, body } => match *status {
            401 | 403 => Outcome::Authorization(format!("HTTP {status}")),
            429 => Outcome::Transient("rate limited".to_string()),
            s if s >= 500 => Outcome::Transient(format!("HTTP {s}")),
            _ => from_kind(FailureKind::classify(None, body), format!("HTTP {status}: {body}")),
        },
        TransportError::Other(detail) => Outcome::Business {
            kind: FailureKind::classify(None, detail),
            message: detail.clone(),
        },
    }
}

fn from_kind(kind: FailureKind, message: String) -> Outcome {
    match kind {
        FailureKind::AuthorizationFailed => Outcome::Authorization(message),
        k if k.is_transient() => Outcome::Transient(message),
        kind => Outcome::Business { kind, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_false_is_never_success() {
        let out = classify_response(json!({"success": false, "error": "Program is full"}));
        assert_eq!(
            out,
            Outcome::Business {
                kind: FailureKind::ProgramFull,
                message: "Program is full".into()
            }
        );
    }

    #[test]
    fn test_error_field_alone_is_failure() {
        let out = classify_response(json!({"data": [], "error": {"message": "boom", "code": "x"}}));
        assert!(!matches!(out, Outcome::Success(_)));
    }

    #[test]
    fn test_success_false_without_error_text() {
        let out = classify_response(json!({"success": false}));
        assert!(matches!(out, Outcome::Business { kind: FailureKind::Unknown, .. }));
    }

    #[test]
    fn test_null_error_is_success() {
        let body = json!({"success": true, "error": null, "programs": []});
        assert_eq!(classify_response(body.clone()), Outcome::Success(body));
    }

    #[test]
    fn test_transient_business_kinds_are_retryable() {
        let out = classify_response(json!({"success": false, "error": "Too many requests"}));
        assert!(matches!(out, Outcome::Transient(_)));
    }

    #[test]
    fn test_transport_classification() {
        assert!(matches!(classify_transport(&TransportError::Timeout), Outcome::Transient(_)));
        assert!(matches!(
            classify_transport(&TransportError::Status { status: 503, body: String::new() }),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify_transport(&TransportError::Status { status: 403, body: String::new() }),
            Outcome::Authorization(_)
        ));
        assert!(matches!(
            classify_transport(&TransportError::Status { status: 422, body: "email is required".into() }),
            Outcome::Business { kind: FailureKind::FormValidationError, .. }
        ));
    }
}
