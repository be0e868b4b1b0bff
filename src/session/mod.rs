//! 会话层：版本化上下文 schema、迁移、存储接口与实现

pub mod context;
#[cfg(feature = "async-sqlite")]
pub mod persistent;
pub mod store;

pub use context::{
    migrate, ChildRef, ContextUpdate, Intent, PrerequisiteResult, ProgramRef, ProviderRef,
    SessionContext, SCHEMA_VERSION,
};
#[cfg(feature = "async-sqlite")]
pub use persistent::{open_pool, SqliteSessionStore};
pub use store::{create_session_store, MemorySessionStore, SessionStore, TieredSessionStore};
