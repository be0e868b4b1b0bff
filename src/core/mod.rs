//! 核心层：错误与恢复、失败分类、时间源、脱敏、单飞、引擎组装

pub mod builder;
pub mod clock;
pub mod error;
pub mod failure;
pub mod recovery;
pub mod sanitize;
pub mod single_flight;

pub use builder::{BuildError, Engine, EngineBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AuthzError, FlowError, RecoveryAction, StoreError, SurfaceError, ToolError};
pub use failure::FailureKind;
pub use recovery::{Recovery, RecoveryEngine};
pub use single_flight::SingleFlight;
