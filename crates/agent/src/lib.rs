pub mod bus;
pub mod context;
pub mod runtime;
pub mod subagent;

#[cfg(test)]
pub(crate) mod test_support;

pub use bus::{MessageBus, OutboundHandler};
pub use context::ContextBuilder;
pub use runtime::{AgentRuntime, AgentSettings, DEFAULT_SESSION_KEY, NO_RESPONSE};
pub use subagent::{Origin, SpawnOptions, SubagentManager, SubagentStatus, NO_FINAL_RESPONSE};
