pub mod agent;
pub mod classes;
pub mod envelope;
pub mod events;
pub mod executor;
pub mod policy;
pub mod providers;
pub mod ratelimit;
pub mod registry;
pub mod tools;
pub mod types;
pub mod validate;

pub use agent::{Agent, AgentConfig, AgentExitReason, AgentOutcome};
pub use envelope::{Envelope, ErrorCode, ToolError, SCHEMA_VERSION};
pub use executor::ToolExecutor;
pub use policy::{ToolPolicy, UserRole};
pub use registry::{ToolRegistry, ToolSpec};
pub use types::{CallContext, Message, PendingUserQuestion};
