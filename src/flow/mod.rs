//! 报名流程状态机：路由、按钮动作、步骤处理器、响应结构与文本润色

pub mod actions;
pub mod handlers;
pub mod machine;
pub mod narrator;
pub mod response;
pub mod step;

pub use actions::FlowAction;
pub use handlers::{extract_age, extract_category, validate_answer, StepHandlers};
pub use machine::{FlowMachine, FlowSettings, Turn};
pub use narrator::Narrator;
pub use response::{recovery_buttons, updates_map, Button, Card, ResponseEnvelope, StepResponse};
pub use step::{route, wants_provider_change, Step};
