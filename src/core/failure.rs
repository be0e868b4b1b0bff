//! 失败分类
//!
//! 第三方报名站点的失败按类型归档：是否可自动重试、给用户的说明、建议的恢复动作。
//! 工具返回 `{success:false, error:"..."}` 或传输层失败时，都先归到某个 FailureKind。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::RecoveryAction;

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 账号密码错误（需要用户重新连接账号）
    AuthenticationFailed,
    /// 授权委托缺失 / 过期 / 范围不足（网关会自动刷新一次）
    AuthorizationFailed,
    NetworkTimeout,
    RateLimited,
    SiteMaintenance,
    CaptchaChallenge,
    ProgramFull,
    PaymentDeclined,
    FormValidationError,
    Unknown,
}

impl FailureKind {
    /// 机器可读代码优先，其次按错误文本匹配
    pub fn classify(code: Option<&str>, message: &str) -> Self {
        if let Some(kind) = code.and_then(Self::from_code) {
            return kind;
        }
        for (re, kind) in patterns() {
            if re.is_match(message) {
                return *kind;
            }
        }
        FailureKind::Unknown
    }

    fn from_code(code: &str) -> Option<Self> {
        let kind = match code.trim().to_ascii_lowercase().as_str() {
            "authentication_failed" | "invalid_credentials" | "login_failed" => {
                FailureKind::AuthenticationFailed
            }
            "authorization_failed" | "mandate_invalid" | "mandate_expired" | "insufficient_scope"
            | "unauthorized" | "forbidden" => FailureKind::AuthorizationFailed,
            "network_timeout" | "timeout" => FailureKind::NetworkTimeout,
            "rate_limited" => FailureKind::RateLimited,
            "site_maintenance" => FailureKind::SiteMaintenance,
            "captcha_challenge" | "captcha" => FailureKind::CaptchaChallenge,
            "program_full" | "sold_out" => FailureKind::ProgramFull,
            "payment_declined" => FailureKind::PaymentDeclined,
            "form_validation_error" | "validation_error" => FailureKind::FormValidationError,
            _ => return None,
        };
        Some(kind)
    }

    /// 可自动退避重试的失败（短时间内可能自行恢复）
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::NetworkTimeout | FailureKind::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::AuthenticationFailed => "authentication_failed",
            FailureKind::AuthorizationFailed => "authorization_failed",
            FailureKind::NetworkTimeout => "network_timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::SiteMaintenance => "site_maintenance",
            FailureKind::CaptchaChallenge => "captcha_challenge",
            FailureKind::ProgramFull => "program_full",
            FailureKind::PaymentDeclined => "payment_declined",
            FailureKind::FormValidationError => "form_validation_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// 面向用户的说明（不含任何内部细节）
    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::AuthenticationFailed => {
                "The provider didn't accept your saved login. Please reconnect your account."
            }
            FailureKind::AuthorizationFailed => {
                "I need you to re-authorize me before I can continue on your behalf."
            }
            FailureKind::NetworkTimeout => {
                "The provider's site is responding slowly right now. Let's try that again."
            }
            FailureKind::RateLimited => {
                "The provider is limiting requests at the moment. Give it a minute and try again."
            }
            FailureKind::SiteMaintenance => {
                "The provider's site is down for maintenance. We can pick this up once it's back."
            }
            FailureKind::CaptchaChallenge => {
                "The provider is asking for a human check. Please sign in once on their site, then reconnect."
            }
            FailureKind::ProgramFull => {
                "That program is full. Want to look at other programs?"
            }
            FailureKind::PaymentDeclined => {
                "The payment was declined. Please update your payment method on the provider's site."
            }
            FailureKind::FormValidationError => {
                "The provider rejected some of the form details. Let's review them."
            }
            FailureKind::Unknown => "Something went wrong on the provider's side. Let's try again.",
        }
    }

    /// 建议的恢复动作
    pub fn recovery(self) -> RecoveryAction {
        match self {
            FailureKind::AuthenticationFailed
            | FailureKind::AuthorizationFailed
            | FailureKind::CaptchaChallenge => RecoveryAction::Reconnect,
            FailureKind::NetworkTimeout | FailureKind::RateLimited | FailureKind::Unknown => {
                RecoveryAction::Retry
            }
            FailureKind::SiteMaintenance => RecoveryAction::ContactSupport,
            FailureKind::ProgramFull => RecoveryAction::ChooseAnotherProgram,
            FailureKind::PaymentDeclined => RecoveryAction::UpdatePayment,
            FailureKind::FormValidationError => RecoveryAction::ReviewForm,
        }
    }
}

fn patterns() -> &'static [(Regex, FailureKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, FailureKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(&str, FailureKind); 9] = [
            (
                r"(?i)mandate|authori[sz]ation (failed|expired|denied)|unauthori[sz]ed|forbidden|insufficient scope",
                FailureKind::AuthorizationFailed,
            ),
            (
                r"(?i)invalid (username|password|credentials)|login failed|wrong password",
                FailureKind::AuthenticationFailed,
            ),
            (r"(?i)captcha", FailureKind::CaptchaChallenge),
            (r"(?i)timed? ?out|timeout", FailureKind::NetworkTimeout),
            (r"(?i)rate limit|too many requests", FailureKind::RateLimited),
            (r"(?i)maintenance", FailureKind::SiteMaintenance),
            (r"(?i)program is (currently )?full|sold out|no (spots|spaces) (left|available)", FailureKind::ProgramFull),
            (r"(?i)declined|card (was )?rejected", FailureKind::PaymentDeclined),
            (r"(?i)required field|is required|validation|check all required", FailureKind::FormValidationError),
        ];
        table
            .into_iter()
            .filter_map(|(p, k)| Regex::new(p).ok().map(|re| (re, k)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_code_wins_over_text() {
        let kind = FailureKind::classify(Some("program_full"), "Request timed out after 30 seconds");
        assert_eq!(kind, FailureKind::ProgramFull);
    }

    #[test]
    fn test_classify_by_text() {
        assert_eq!(
            FailureKind::classify(None, "Invalid username or password"),
            FailureKind::AuthenticationFailed
        );
        assert_eq!(
            FailureKind::classify(None, "Request timed out after 30 seconds"),
            FailureKind::NetworkTimeout
        );
        assert_eq!(
            FailureKind::classify(None, "This program is currently full"),
            FailureKind::ProgramFull
        );
        assert_eq!(
            FailureKind::classify(None, "Payment was declined by your bank"),
            FailureKind::PaymentDeclined
        );
        assert_eq!(
            FailureKind::classify(None, "Please check all required fields"),
            FailureKind::FormValidationError
        );
        assert_eq!(
            FailureKind::classify(None, "authorization failed: mandate expired"),
            FailureKind::AuthorizationFailed
        );
        assert_eq!(FailureKind::classify(None, "boom"), FailureKind::Unknown);
    }

    #[test]
    fn test_terminal_failures_are_not_transient() {
        assert!(!FailureKind::ProgramFull.is_transient());
        assert!(!FailureKind::PaymentDeclined.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
    }

    #[test]
    fn test_recovery_for_credentials_is_reconnect() {
        assert_eq!(FailureKind::AuthenticationFailed.recovery(), RecoveryAction::Reconnect);
        assert_eq!(FailureKind::CaptchaChallenge.recovery(), RecoveryAction::Reconnect);
    }
}
