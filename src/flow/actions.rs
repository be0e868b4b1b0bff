//! 按钮动作：闭合的标签联合
//!
//! 每个动作都在路由前转换成上下文变更；新增动作时 match 不完整会直接编译失败。

use serde::{Deserialize, Serialize};

use crate::session::{ChildRef, ContextUpdate, ProgramRef, ProviderRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum FlowAction {
    SelectProvider(ProviderRef),
    ChangeProvider,
    /// 由界面打开账号连接流程，本身不改上下文
    ConnectAccount,
    CredentialsSaved { credential_ref: String },
    SetIntent {
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        child_age: Option<u8>,
    },
    SelectChild(ChildRef),
    SelectProgram(ProgramRef),
    AnswerField { field: String, value: String },
    ReviewForm,
    ConfirmRegistration,
    CancelRegistration,
    ChooseAnotherProgram,
    Retry,
    Reconnect,
    StartOver,
}

impl FlowAction {
    pub fn name(&self) -> &'static str {
        match self {
            FlowAction::SelectProvider(_) => "select_provider",
            FlowAction::ChangeProvider => "change_provider",
            FlowAction::ConnectAccount => "connect_account",
            FlowAction::CredentialsSaved { .. } => "credentials_saved",
            FlowAction::SetIntent { .. } => "set_intent",
            FlowAction::SelectChild(_) => "select_child",
            FlowAction::SelectProgram(_) => "select_program",
            FlowAction::AnswerField { .. } => "answer_field",
            FlowAction::ReviewForm => "review_form",
            FlowAction::ConfirmRegistration => "confirm_registration",
            FlowAction::CancelRegistration => "cancel_registration",
            FlowAction::ChooseAnotherProgram => "choose_another_program",
            FlowAction::Retry => "retry",
            FlowAction::Reconnect => "reconnect",
            FlowAction::StartOver => "start_over",
        }
    }

    /// 动作对应的上下文变更
    ///
    /// 确认报名不在这里改上下文：报名调用由 confirmation 步骤执行，成功后才写入报名号。
    pub fn to_updates(&self) -> Vec<ContextUpdate> {
        match self {
            FlowAction::SelectProvider(p) => vec![ContextUpdate::Provider(p.clone())],
            FlowAction::ChangeProvider => vec![ContextUpdate::ClearProvider],
            FlowAction::ConnectAccount => vec![],
            FlowAction::CredentialsSaved { credential_ref } => {
                vec![ContextUpdate::CredentialRef(credential_ref.clone())]
            }
            FlowAction::SetIntent { category, child_age } => {
                let mut out = Vec::new();
                if let Some(c) = category {
                    out.push(ContextUpdate::IntentCategory(c.clone()));
                }
                if let Some(a) = child_age {
                    out.push(ContextUpdate::ChildAge(*a));
                }
                out
            }
            FlowAction::SelectChild(c) => vec![ContextUpdate::Child(c.clone())],
            FlowAction::SelectProgram(p) => vec![ContextUpdate::Program(p.clone())],
            FlowAction::AnswerField { field, value } => vec![ContextUpdate::FormAnswer {
                field: field.clone(),
                value: value.clone(),
            }],
            FlowAction::ReviewForm => vec![ContextUpdate::ReopenForm],
            FlowAction::ConfirmRegistration => vec![],
            FlowAction::CancelRegistration | FlowAction::ChooseAnotherProgram => {
                vec![ContextUpdate::ClearProgram]
            }
            FlowAction::Retry => vec![],
            FlowAction::Reconnect => vec![ContextUpdate::ClearSession],
            FlowAction::StartOver => vec![ContextUpdate::StartOver],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let a = FlowAction::SelectProvider(ProviderRef {
            id: "acme".into(),
            name: "Acme Club".into(),
            org_ref: None,
        });
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["action"], "select_provider");
        assert_eq!(v["payload"]["id"], "acme");

        let retry: FlowAction = serde_json::from_value(json!({"action": "retry"})).unwrap();
        assert_eq!(retry, FlowAction::Retry);
        assert_eq!(retry.name(), "retry");
    }

    #[test]
    fn test_updates() {
        let a = FlowAction::SetIntent {
            category: Some("ski".into()),
            child_age: None,
        };
        assert_eq!(a.to_updates(), vec![ContextUpdate::IntentCategory("ski".into())]);
        assert_eq!(FlowAction::Reconnect.to_updates(), vec![ContextUpdate::ClearSession]);
        assert!(FlowAction::ConfirmRegistration.to_updates().is_empty());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        // 表单在最后一个必填答案到达时自动完成，没有单独的提交动作
        assert!(serde_json::from_value::<FlowAction>(json!({"action": "submit_form"})).is_err());
        assert!(serde_json::from_value::<FlowAction>(json!({"action": "teleport"})).is_err());
    }

    #[test]
    fn test_set_intent_payload_defaults() {
        let a: FlowAction =
            serde_json::from_value(json!({"action": "set_intent", "payload": {"child_age": 9}})).unwrap();
        assert_eq!(a.to_updates(), vec![ContextUpdate::ChildAge(9)]);
    }
}
