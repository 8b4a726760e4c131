use nanocell_core::{Config, Paths};
use std::io::{self, Write};

const AGENTS_MD: &str = r#"# Agent Guidelines

You are nanocell, a helpful AI assistant.

## Core Behaviors
- Be helpful, accurate, and concise
- Use tools when needed to accomplish tasks
- Ask for clarification when instructions are ambiguous

## Background Work
- Use `spawn` for long-running or independent tasks
- You will receive the result when the subagent finishes; summarize it for the user
"#;

const SOUL_MD: &str = r#"# Personality

I am nanocell, a thoughtful and capable AI assistant.

## Communication Style
- Clear and concise
- Professional yet friendly
"#;

const USER_MD: &str = r#"# User Preferences

<!-- Add your preferences here -->

## Language
- Preferred language: English
"#;

const TOOLS_MD: &str = r#"# Available Tools

## spawn
Start a subagent for a task in the background.
- **task**: What the subagent should do
- **label**: Optional short label

## message
Send a message to a specific channel/chat.
- **content**: Message content
- **channel**: Target channel (optional)
- **chat_id**: Target chat ID (optional)

**Note**: Only use this for sending to other channels. For normal conversation, respond directly.
"#;

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;

    Config::default().save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());

    write_if_not_exists(&paths.agents_md(), AGENTS_MD)?;
    write_if_not_exists(&paths.soul_md(), SOUL_MD)?;
    write_if_not_exists(&paths.user_md(), USER_MD)?;
    write_if_not_exists(&paths.tools_md(), TOOLS_MD)?;

    println!("✓ Created workspace: {}", paths.workspace().display());
    println!();
    println!("Next steps:");
    println!(
        "  1. Edit {} to add your API keys (or set ANTHROPIC_API_KEY / OPENAI_API_KEY)",
        paths.config_file().display()
    );
    println!("  2. Run `nanocell status` to verify configuration");
    println!("  3. Run `nanocell agent` to start chatting");

    Ok(())
}

fn write_if_not_exists(path: &std::path::Path, content: &str) -> io::Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        if let Some(name) = path.file_name() {
            println!("  ✓ Created {}", name.to_string_lossy());
        }
    }
    Ok(())
}
