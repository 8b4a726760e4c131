use nanocell_core::{Config, Paths};
use nanocell_providers::ProviderKind;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("nanocell status");
    println!("===============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found)" }
    );

    let config = Config::load_or_default(&paths)?;

    let workspace_path = config.workspace_path();
    println!(
        "Workspace: {} {}",
        workspace_path.display(),
        if workspace_path.exists() { "✓" } else { "✗ (not found)" }
    );

    let model = &config.agents.defaults.model;
    let kind = ProviderKind::from_model(model);
    println!("Model:     {} (via {})", model, kind.config_key());
    println!();

    println!("Providers:");
    for kind in [ProviderKind::Anthropic, ProviderKind::OpenAI] {
        let name = kind.config_key();
        let status = match config.get_provider(name) {
            Some(provider) if !provider.api_key.is_empty() => "✓ configured",
            Some(_) => "✗ no key",
            None => "✗ not found",
        };
        println!("  {:<12} {}", name, status);
    }

    if !config_exists {
        println!();
        println!("Run `nanocell onboard` to initialize.");
    }

    Ok(())
}
