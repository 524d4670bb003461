use super::PipelineStage;
use crate::error::{ProviderError, StageError};
use crate::llm::registry::ProviderSet;
use crate::llm::{ChatCompletionOptions, Message, NormalizedChatResponse, Role};
use crate::tools::ToolRegistry;
use std::sync::Arc;
use tracing::{debug, info};

pub struct LlmCompletionInput {
    pub messages: Vec<Message>,
    pub options: ChatCompletionOptions,
}

/// One provider round-trip, normalized.
pub struct LlmCompletionStage {
    providers: Arc<ProviderSet>,
    tools: Arc<ToolRegistry>,
}

impl LlmCompletionStage {
    pub fn new(providers: Arc<ProviderSet>, tools: Arc<ToolRegistry>) -> Self {
        Self { providers, tools }
    }

    /// The provider a request is routed to: the resolved one, else the
    /// configured selection.
    pub fn resolve_provider_name(&self, options: &ChatCompletionOptions) -> Option<String> {
        options
            .provider
            .as_deref()
            .or_else(|| self.providers.selected_provider())
            .map(str::to_string)
    }
}

impl PipelineStage for LlmCompletionStage {
    type Input = LlmCompletionInput;
    type Output = NormalizedChatResponse;

    fn name(&self) -> &'static str {
        "llm_completion"
    }

    fn process(&self, input: LlmCompletionInput) -> Result<NormalizedChatResponse, StageError> {
        let LlmCompletionInput { messages, mut options } = input;

        let name = self.resolve_provider_name(&options).ok_or_else(|| {
            StageError::Configuration("No AI provider is selected".to_string())
        })?;
        let provider = self
            .providers
            .get(&name)
            .ok_or_else(|| ProviderError::unavailable(&name, "provider is not registered"))?;
        if !provider.is_available() {
            return Err(ProviderError::unavailable(
                &name,
                "AI is disabled or credentials are not configured",
            )
            .into());
        }

        if options.tools_enabled() && options.tools.is_empty() {
            options.tools = self.tools.get_all_tool_definitions();
        }
        if options.tools_enabled() && !options.tools.is_empty() {
            options.enable_tools = Some(true);
        }

        let tool_results = messages.iter().filter(|m| m.role == Role::Tool).count();
        debug!(
            provider = %name,
            model = options.model.as_deref().unwrap_or("default"),
            messages = messages.len(),
            tool_results,
            tools = options.tools.len(),
            stream = options.wants_stream(),
            "requesting completion"
        );

        let response = provider.generate_chat_completion(&messages, &options)?;
        let normalized = provider.to_normalized_response(response);

        if tool_results > 0 {
            if normalized.has_tool_calls() {
                info!(
                    provider = %name,
                    calls = normalized.tool_calls.len(),
                    "follow-up requested more tools"
                );
            } else {
                info!(provider = %name, "follow-up returned a final answer");
            }
        }
        Ok(normalized)
    }
}
