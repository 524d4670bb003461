//! MiniMax through its Anthropic-compatible endpoint.
//!
//! Differences from Anthropic proper: its own defaults, and `tool_choice`
//! defaults to `any` whenever tools are sent, since the model otherwise tends
//! to answer note questions without looking anything up.

use super::anthropic::{self, Dialect};
use super::client::{AdapterCore, AdapterOptions};
use super::{ChatCompletionOptions, ChatResponse, LlmProvider, Message, ToolChoice};
use crate::config::ProviderSettings;
use crate::error::ProviderError;

pub const PROVIDER: &str = "minimax";
pub const DEFAULT_BASE_URL: &str = "https://api.minimax.io/anthropic";
pub const DEFAULT_MODEL: &str = "MiniMax-M2.1";

const MINIMAX: Dialect = Dialect {
    provider: PROVIDER,
    default_base_url: DEFAULT_BASE_URL,
    default_model: DEFAULT_MODEL,
    default_tool_choice: Some(ToolChoice::Any),
};

pub struct MiniMaxClient {
    core: AdapterCore,
}

impl MiniMaxClient {
    pub fn new(settings: ProviderSettings, options: AdapterOptions) -> Self {
        Self {
            core: AdapterCore::new(PROVIDER, settings, options),
        }
    }
}

impl LlmProvider for MiniMaxClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn is_available(&self) -> bool {
        self.core.ai_enabled() && self.core.has_api_key()
    }

    fn default_model(&self) -> Option<String> {
        Some(self.core.model(&ChatCompletionOptions::default(), DEFAULT_MODEL))
    }

    fn generate_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatCompletionOptions,
    ) -> Result<ChatResponse, ProviderError> {
        anthropic::complete(&MINIMAX, &self.core, messages, options)
    }

    fn clear_cache(&self) {
        self.core.clear_cache();
    }

    fn update_settings(&self, settings: ProviderSettings) {
        self.core.update_settings(settings);
    }
}
