mod commands;

use clap::{Parser, Subcommand};
use nanocell_agent::DEFAULT_SESSION_KEY;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nanocell")]
#[command(about = "A small tool-using AI agent with background subagents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize nanocell configuration and workspace
    Onboard {
        /// Overwrite an existing configuration without asking
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration status
    Status,

    /// Chat with the agent
    Agent {
        /// Message to send (interactive mode if not provided)
        #[arg(short, long)]
        message: Option<String>,

        /// Session key, `<channel>:<chat_id>`
        #[arg(short, long, default_value = DEFAULT_SESSION_KEY)]
        session: String,
    },

    /// Run the bus-driven agent loop until Ctrl-C
    Gateway,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the flag when set.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Agent { message, session } => {
            commands::agent::run(message, session).await?;
        }
        Commands::Gateway => {
            commands::gateway::run().await?;
        }
    }

    Ok(())
}
