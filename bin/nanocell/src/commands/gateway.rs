use nanocell_agent::MessageBus;
use nanocell_core::{OutboundMessage, Paths};
use std::sync::Arc;
use tracing::info;

use super::build_runtime;

/// Runs the agent loop and outbound dispatcher on a shared bus. Only a
/// `cli` subscriber is attached here; other delivery channels subscribe
/// through [`MessageBus::subscribe_outbound`].
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let bus = Arc::new(MessageBus::new());
    let runtime = Arc::new(build_runtime(&paths, bus.clone())?);

    bus.subscribe_outbound("cli", |msg: OutboundMessage| async move {
        println!("[{}:{}] {}", msg.channel, msg.chat_id, msg.content);
        Ok::<(), nanocell_core::Error>(())
    });

    let agent_loop = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run_loop().await })
    };
    let dispatcher = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.dispatch_outbound().await })
    };

    info!(tools = ?runtime.tools().tool_names(), "Gateway running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!(
        pending_inbound = bus.inbound_size(),
        running_subagents = runtime.subagents().running_count(),
        "Shutting down gateway"
    );
    bus.stop();
    let _ = agent_loop.await;
    let _ = dispatcher.await;
    Ok(())
}
