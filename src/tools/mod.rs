pub mod catalog;
pub mod gateway;
pub mod outcome;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod stats;

pub use catalog::Operation;
pub use gateway::{GatewaySettings, ToolGateway};
pub use outcome::{classify_response, classify_transport, Outcome, TransportError};
pub use registry::{Tool, ToolRegistry};
pub use remote::{register_remote_tools, RemoteTool};
pub use retry::RetryPolicy;
pub use stats::{ToolStats, ToolStatsSnapshot};
