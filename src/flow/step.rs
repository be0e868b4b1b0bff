//! 流程步骤与路由
//!
//! route 是纯函数：同样的 (消息, 上下文) 永远得到同样的步骤。LLM 不参与路由。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::session::SessionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ProviderSearch,
    Login,
    IntentCapture,
    FieldProbe,
    ProgramSelection,
    PrerequisiteCheck,
    FormFill,
    Confirmation,
    Completed,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::ProviderSearch,
        Step::Login,
        Step::IntentCapture,
        Step::FieldProbe,
        Step::ProgramSelection,
        Step::PrerequisiteCheck,
        Step::FormFill,
        Step::Confirmation,
        Step::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::ProviderSearch => "provider_search",
            Step::Login => "login",
            Step::IntentCapture => "intent_capture",
            Step::FieldProbe => "field_probe",
            Step::ProgramSelection => "program_selection",
            Step::PrerequisiteCheck => "prerequisite_check",
            Step::FormFill => "form_fill",
            Step::Confirmation => "confirmation",
            Step::Completed => "completed",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn change_provider_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(change|switch|different|another|other|new)\s+(the\s+)?(provider|club|organi[sz]ation|program provider)\b",
        )
        .expect("static regex")
    })
}

/// 消息是否明确要求更换 provider
pub fn wants_provider_change(message: &str) -> bool {
    change_provider_re().is_match(message)
}

/// 根据上下文决定当前步骤
pub fn route(message: &str, ctx: &SessionContext) -> Step {
    if ctx.registration_ref.is_some() {
        return Step::Completed;
    }
    if ctx.provider.is_none() || wants_provider_change(message) {
        return Step::ProviderSearch;
    }
    if !ctx.login_confirmed {
        return Step::Login;
    }
    if !ctx.intent.is_complete() {
        return Step::IntentCapture;
    }
    if ctx.discovered_fields.is_none() {
        return Step::FieldProbe;
    }
    if ctx.program.is_none() {
        return Step::ProgramSelection;
    }
    if ctx.prerequisites.is_none() {
        return Step::PrerequisiteCheck;
    }
    if !ctx.form_complete {
        return Step::FormFill;
    }
    Step::Confirmation
}
