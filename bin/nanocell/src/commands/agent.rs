use nanocell_agent::MessageBus;
use nanocell_core::{InboundMessage, OutboundMessage, Paths};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::build_runtime;

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

pub async fn run(message: Option<String>, session: String) -> anyhow::Result<()> {
    let paths = Paths::new();
    let bus = Arc::new(MessageBus::new());
    let runtime = Arc::new(build_runtime(&paths, bus.clone())?);

    if let Some(message) = message {
        let answer = runtime.process_direct(&message, Some(&session)).await;
        println!("{}", answer);
        if runtime.subagents().running_count() > 0 {
            eprintln!("Note: background subagents are dropped when this command exits. Use interactive mode to receive their results.");
        }
        return Ok(());
    }

    let (channel, chat_id) = session
        .split_once(':')
        .map(|(c, id)| (c.to_string(), id.to_string()))
        .unwrap_or_else(|| ("cli".to_string(), session.clone()));

    // Replies (including summaries of finished subagents) arrive on the bus.
    bus.subscribe_outbound(&channel, |msg: OutboundMessage| async move {
        println!("\n{}\n", msg.content);
        print_prompt();
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

    println!("nanocell interactive mode (session {}). Type `exit` or `quit` to leave.", session);
    print_prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            print_prompt();
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }
        debug!(len = input.len(), "Queueing user input");
        bus.publish_inbound(InboundMessage::new(&channel, "user", &chat_id, input));
    }

    bus.stop();
    let _ = agent_loop.await;
    let _ = dispatcher.await;
    Ok(())
}
