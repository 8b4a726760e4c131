pub mod agent;
pub mod gateway;
pub mod onboard;
pub mod status;

use nanocell_agent::{AgentRuntime, AgentSettings, MessageBus};
use nanocell_core::{Config, Paths};
use nanocell_providers::create_provider;
use nanocell_storage::SessionManager;
use nanocell_tools::ToolRegistry;
use std::sync::Arc;

/// Loads the config and wires a runtime onto `bus`.
///
/// Concrete file/shell/web tools live outside this workspace, so the worker
/// tool set starts empty; the runtime still adds `spawn` and `message`.
pub(crate) fn build_runtime(paths: &Paths, bus: Arc<MessageBus>) -> anyhow::Result<AgentRuntime> {
    let config = Config::load_or_default(paths)?;
    let settings = AgentSettings::from_config(&config);
    let provider = create_provider(&config, &settings.model);
    let sessions = SessionManager::new(paths.clone());

    Ok(AgentRuntime::new(
        settings,
        provider,
        bus,
        sessions,
        ToolRegistry::new(),
    ))
}
