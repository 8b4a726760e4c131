use std::sync::Arc;

use nanocell_core::Config;
use tracing::{info, warn};

use crate::{AnthropicProvider, OpenAIProvider, Provider};

/// The closed set of supported backend shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    /// Infers the backend from the model name: `anthropic/...` and `claude-...`
    /// go to Anthropic, everything else to the OpenAI-compatible API.
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.starts_with("anthropic/") || lower.starts_with("claude-") {
            ProviderKind::Anthropic
        } else {
            ProviderKind::OpenAI
        }
    }

    /// Key of this backend in `config.providers`.
    pub fn config_key(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Builds the provider for `model`. The backend is chosen once here from the
/// model prefix; the model itself becomes the provider's default.
pub fn create_provider(config: &Config, model: &str) -> Arc<dyn Provider> {
    let kind = ProviderKind::from_model(model);
    let provider_config = config
        .get_provider(kind.config_key())
        .cloned()
        .unwrap_or_default();

    if provider_config.api_key.is_empty() {
        warn!(provider = kind.config_key(), "No API key configured");
    }
    info!(provider = kind.config_key(), model = %model, "Creating provider");

    let api_base = provider_config.api_base.as_deref();
    match kind {
        ProviderKind::Anthropic => Arc::new(
            AnthropicProvider::new(&provider_config.api_key, api_base, provider_config.auth_type)
                .with_default_model(model),
        ),
        ProviderKind::OpenAI => Arc::new(
            OpenAIProvider::new(&provider_config.api_key, api_base).with_default_model(model),
        ),
    }
}
