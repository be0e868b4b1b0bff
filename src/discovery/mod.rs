//! 表单字段探测：填充 → 提交 → 观察校验错误，直到成功、不动点或轮数上限

pub mod chrome;
pub mod engine;
pub mod field;
pub mod heuristics;
pub mod scripted;
pub mod surface;
pub mod tool;

#[cfg(feature = "browser")]
pub use chrome::{ChromeSurface, ChromeSurfaceFactory};
pub use engine::{confidence, DiscoveryConfig, DiscoveryEngine, DiscoveryRun, RunMetadata, Termination};
pub use field::{DiscoveredField, FieldMap, FieldType};
pub use scripted::{ScriptedForm, ScriptedFormFactory};
pub use surface::{ElementHandle, FormSurface, SurfaceFactory};
pub use tool::{DiscoveryTool, DISCOVERY_TOOL};
