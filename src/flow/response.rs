//! 步骤响应
//!
//! 处理器返回 StepResponse（上下文变更为有序的 ContextUpdate 列表）；
//! 对外输出 ResponseEnvelope：`{message, cards?, cta?, contextUpdates: {field: value}}`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::actions::FlowAction;
use super::step::Step;
use crate::core::RecoveryAction;
use crate::session::ContextUpdate;

/// 按钮：`{label, action, payload?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    #[serde(flatten)]
    pub action: FlowAction,
}

impl Button {
    pub fn new(label: impl Into<String>, action: FlowAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

/// 处理器输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResponse {
    pub message: String,
    pub cards: Vec<Card>,
    pub cta: Vec<Button>,
    pub updates: Vec<ContextUpdate>,
    /// 本步骤无需用户输入，应用变更后继续下一步
    pub advance: bool,
}

impl StepResponse {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_cards(mut self, cards: Vec<Card>) -> Self {
        self.cards = cards;
        self
    }

    pub fn with_cta(mut self, cta: Vec<Button>) -> Self {
        self.cta = cta;
        self
    }

    pub fn with_updates(mut self, updates: Vec<ContextUpdate>) -> Self {
        self.updates = updates;
        self
    }

    pub fn advancing(mut self) -> Self {
        self.advance = true;
        self
    }
}

/// 对外响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cards: Vec<Card>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cta: Vec<Button>,
    #[serde(default)]
    pub context_updates: Map<String, Value>,
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryAction>,
}

/// 有序变更折叠成 `{field: value}`；同一字段以最后一次为准，内部变更不输出
pub fn updates_map(updates: &[ContextUpdate]) -> Map<String, Value> {
    let mut map = Map::new();
    for u in updates.iter().filter(|u| !u.is_internal()) {
        map.insert(u.field_name(), u.value_json());
    }
    map
}

/// 恢复动作对应的按钮
pub fn recovery_buttons(action: RecoveryAction) -> Vec<Button> {
    match action {
        RecoveryAction::Retry => vec![Button::new("Try again", FlowAction::Retry)],
        RecoveryAction::Reconnect => vec![Button::new("Reconnect account", FlowAction::Reconnect)],
        RecoveryAction::UpdatePayment => vec![
            Button::new("I've updated my payment", FlowAction::Retry),
            Button::new("Choose another program", FlowAction::ChooseAnotherProgram),
        ],
        RecoveryAction::ChooseAnotherProgram => {
            vec![Button::new("See other programs", FlowAction::ChooseAnotherProgram)]
        }
        RecoveryAction::ReviewForm => vec![Button::new("Review my answers", FlowAction::ReviewForm)],
        RecoveryAction::ContactSupport => vec![
            Button::new("Try again", FlowAction::Retry),
            Button::new("Start over", FlowAction::StartOver),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_button_serializes_flat() {
        let b = Button::new("Try again", FlowAction::Retry);
        assert_eq!(serde_json::to_value(&b).unwrap(), json!({"label": "Try again", "action": "retry"}));

        let b = Button::new(
            "Confirm",
            FlowAction::AnswerField {
                field: "email".into(),
                value: "a@b.c".into(),
            },
        );
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["action"], "answer_field");
        assert_eq!(v["payload"]["field"], "email");
    }

    #[test]
    fn test_envelope_shape() {
        let env = ResponseEnvelope {
            message: "hi".into(),
            cards: vec![],
            cta: vec![],
            context_updates: updates_map(&[
                ContextUpdate::ChildAge(8),
                ContextUpdate::RecordCacheKey("k".into()),
                ContextUpdate::ChildAge(9),
            ]),
            step: Step::IntentCapture,
            recovery: None,
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["contextUpdates"]["child_age"], 9);
        assert_eq!(v["step"], "intent_capture");
        assert!(v.get("cards").is_none());
        assert_eq!(v["contextUpdates"].as_object().unwrap().len(), 1);
    }
}
