//! Name-to-adapter lookup built from configuration.

use super::client::AdapterOptions;
use super::{anthropic, minimax, ollama, openai, LlmProvider};
use crate::config::{Config, ProviderSettings};
use std::sync::Arc;
use tracing::{debug, warn};

pub const KNOWN_PROVIDERS: &[&str] = &[
    openai::PROVIDER,
    anthropic::PROVIDER,
    ollama::PROVIDER,
    minimax::PROVIDER,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIdentifier {
    pub provider: Option<String>,
    pub model: String,
}

/// Splits `provider:model`. Only known provider prefixes are split off, so an
/// Ollama tag such as `llama3:8b` stays a bare model name.
pub fn parse_model_identifier(identifier: &str) -> ModelIdentifier {
    let identifier = identifier.trim();
    if let Some((prefix, model)) = identifier.split_once(':') {
        let prefix = prefix.trim().to_ascii_lowercase();
        if KNOWN_PROVIDERS.contains(&prefix.as_str()) && !model.trim().is_empty() {
            return ModelIdentifier {
                provider: Some(prefix),
                model: model.trim().to_string(),
            };
        }
    }
    ModelIdentifier {
        provider: None,
        model: identifier.to_string(),
    }
}

pub fn default_model_for(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        openai::PROVIDER => Some(openai::DEFAULT_MODEL),
        anthropic::PROVIDER => Some(anthropic::DEFAULT_MODEL),
        ollama::PROVIDER => Some(ollama::DEFAULT_MODEL),
        minimax::PROVIDER => Some(minimax::DEFAULT_MODEL),
        _ => None,
    }
}

pub fn create_provider(
    name: &str,
    settings: ProviderSettings,
    options: AdapterOptions,
) -> Option<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match name.to_ascii_lowercase().as_str() {
        openai::PROVIDER => Arc::new(openai::OpenAiClient::new(settings, options)),
        anthropic::PROVIDER => Arc::new(anthropic::AnthropicClient::new(settings, options)),
        ollama::PROVIDER => Arc::new(ollama::OllamaClient::new(settings, options)),
        minimax::PROVIDER => Arc::new(minimax::MiniMaxClient::new(settings, options)),
        other => {
            warn!(provider = other, "unknown provider");
            return None;
        }
    };
    Some(provider)
}

/// The adapters a pipeline can route to, plus the configured default.
#[derive(Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn LlmProvider>>,
    selected: Option<String>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known adapter, configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        let options = AdapterOptions::from_config(config);
        let mut set = Self::new();
        for name in KNOWN_PROVIDERS {
            if let Some(provider) =
                create_provider(name, config.provider_settings(name), options.clone())
            {
                set.register(provider);
            }
        }
        set.set_selected(&config.ai.selected_provider);
        set
    }

    /// Adds an adapter, replacing one with the same name.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_ascii_lowercase();
        self.providers
            .retain(|p| !p.name().eq_ignore_ascii_case(&name));
        debug!(provider = %name, "registered provider");
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Sets the default provider. A blank name clears it.
    pub fn set_selected(&mut self, name: &str) {
        let name = name.trim();
        self.selected = (!name.is_empty()).then(|| name.to_ascii_lowercase());
    }

    pub fn with_selected(mut self, name: &str) -> Self {
        self.set_selected(name);
        self
    }

    pub fn selected_provider(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
            .map(Arc::clone)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn providers(&self) -> &[Arc<dyn LlmProvider>] {
        &self.providers
    }

    /// Pushes new settings to one adapter. Returns false for unknown names.
    pub fn update_settings(&self, name: &str, settings: ProviderSettings) -> bool {
        match self.get(name) {
            Some(provider) => {
                provider.update_settings(settings);
                true
            }
            None => false,
        }
    }

    pub fn clear_caches(&self) {
        for provider in &self.providers {
            provider.clear_cache();
        }
    }
}
