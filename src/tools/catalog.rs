//! 工具目录：provider 工具的命名、所需能力、缓存与会话策略
//!
//! 命名约定 `{provider}_{operation}`；`provider_search` 与 provider 无关。

use chrono::Duration;

use crate::mandate::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ProviderSearch,
    Login,
    FindPrograms,
    CheckPrerequisites,
    CheckAvailability,
    Register,
}

impl Operation {
    /// 所有按 provider 注册的操作
    pub const PROVIDER_SCOPED: [Operation; 5] = [
        Operation::Login,
        Operation::FindPrograms,
        Operation::CheckPrerequisites,
        Operation::CheckAvailability,
        Operation::Register,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Operation::ProviderSearch => "provider_search",
            Operation::Login => "login",
            Operation::FindPrograms => "find_programs",
            Operation::CheckPrerequisites => "check_prerequisites",
            Operation::CheckAvailability => "check_availability",
            Operation::Register => "register",
        }
    }

    pub fn tool_name(self, provider: &str) -> String {
        match self {
            Operation::ProviderSearch => self.suffix().to_string(),
            op => format!("{}_{}", provider, op.suffix()),
        }
    }

    pub fn required_capabilities(self) -> &'static [Capability] {
        match self {
            Operation::ProviderSearch => &[],
            Operation::Login => &[Capability::Authenticate],
            Operation::FindPrograms | Operation::CheckAvailability | Operation::CheckPrerequisites => {
                &[Capability::Read]
            }
            Operation::Register => &[Capability::Register, Capability::Pay],
        }
    }

    /// 前置条件、余位与报名结果必须实时查询，不缓存
    pub fn cache_ttl(self) -> Option<Duration> {
        match self {
            Operation::ProviderSearch => Some(Duration::minutes(10)),
            Operation::FindPrograms => Some(Duration::minutes(15)),
            Operation::Login
            | Operation::CheckPrerequisites
            | Operation::CheckAvailability
            | Operation::Register => None,
        }
    }

    pub fn opens_session(self) -> bool {
        matches!(self, Operation::Login)
    }
}
