use super::PipelineStage;
use crate::error::StageError;
use crate::llm::registry::{default_model_for, parse_model_identifier, ProviderSet};
use crate::llm::ChatCompletionOptions;
use crate::tools::ToolRegistry;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const COMPLEX_TERMS: &[&str] = &[
    "explain",
    "analyze",
    "compare",
    "evaluate",
    "synthesize",
    "summarize",
    "elaborate",
    "investigate",
    "research",
    "debate",
];
const LONG_QUERY_CHARS: usize = 100;
const MEDIUM_CONTENT_CHARS: usize = 5_000;
const HIGH_CONTENT_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComplexity {
    Low,
    Medium,
    High,
}

impl fmt::Display for QueryComplexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryComplexity::Low => write!(f, "low"),
            QueryComplexity::Medium => write!(f, "medium"),
            QueryComplexity::High => write!(f, "high"),
        }
    }
}

/// Rough estimate from wording and size. Only used for logging.
pub fn estimate_complexity(query: Option<&str>, content_length: usize) -> QueryComplexity {
    let mut complexity = QueryComplexity::Low;
    if let Some(query) = query {
        let lower = query.to_lowercase();
        let has_complex_terms = COMPLEX_TERMS.iter().any(|t| lower.contains(t));
        let is_long = query.chars().count() > LONG_QUERY_CHARS;
        let multiple_questions = query.matches('?').count() > 1;

        complexity = if (has_complex_terms && is_long) || multiple_questions {
            QueryComplexity::High
        } else if has_complex_terms || is_long {
            QueryComplexity::Medium
        } else {
            QueryComplexity::Low
        };
    }

    if content_length > HIGH_CONTENT_CHARS {
        QueryComplexity::High
    } else if content_length > MEDIUM_CONTENT_CHARS {
        QueryComplexity::Medium
    } else {
        complexity
    }
}

pub struct ModelSelectionInput {
    pub options: ChatCompletionOptions,
    pub query: Option<String>,
    pub content_length: usize,
}

/// Resolves provider and model, and turns tools on unless the caller opted out.
pub struct ModelSelectionStage {
    providers: Arc<ProviderSet>,
    tools: Arc<ToolRegistry>,
}

impl ModelSelectionStage {
    pub fn new(providers: Arc<ProviderSet>, tools: Arc<ToolRegistry>) -> Self {
        Self { providers, tools }
    }

    fn attach_tools(&self, options: &mut ChatCompletionOptions) {
        options.enable_tools = Some(options.tools_enabled());
        if options.tools_enabled() && options.tools.is_empty() {
            options.tools = self.tools.get_all_tool_definitions();
            debug!(tools = options.tools.len(), "attached tool definitions");
        }
    }
}

impl PipelineStage for ModelSelectionStage {
    type Input = ModelSelectionInput;
    type Output = ChatCompletionOptions;

    fn name(&self) -> &'static str {
        "model_selection"
    }

    fn process(&self, input: ModelSelectionInput) -> Result<ChatCompletionOptions, StageError> {
        let mut options = input.options;
        self.attach_tools(&mut options);

        let requested = options
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(parse_model_identifier);

        if let Some(identifier) = requested {
            if identifier.provider.is_some() {
                options.provider = identifier.provider;
            }
            info!(
                model = %identifier.model,
                provider = options.provider.as_deref().unwrap_or("default"),
                "using requested model"
            );
            options.model = Some(identifier.model);
            return Ok(options);
        }

        let provider = options
            .provider
            .clone()
            .or_else(|| self.providers.selected_provider().map(str::to_string))
            .ok_or_else(|| {
                StageError::Configuration(
                    "No AI provider is selected. Please select a provider in your AI settings."
                        .to_string(),
                )
            })?;

        let model = self
            .providers
            .get(&provider)
            .and_then(|p| p.default_model())
            .or_else(|| default_model_for(&provider).map(str::to_string))
            .ok_or_else(|| {
                StageError::Configuration(format!(
                    "No default model configured for provider {}. Please set a default model in your AI settings.",
                    provider
                ))
            })?;

        let complexity = estimate_complexity(input.query.as_deref(), input.content_length);
        info!(%provider, %model, %complexity, "selected model");

        options.provider = Some(provider);
        options.model = Some(model);
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tools::default_registry;
    use crate::tools::notes::MemoryNoteStore;

    fn stage(selected: &str) -> ModelSelectionStage {
        let providers = ProviderSet::from_config(&Config::default()).with_selected(selected);
        let tools = default_registry(Arc::new(MemoryNoteStore::default()));
        ModelSelectionStage::new(Arc::new(providers), Arc::new(tools))
    }

    fn input(options: ChatCompletionOptions) -> ModelSelectionInput {
        ModelSelectionInput {
            options,
            query: None,
            content_length: 0,
        }
    }

    #[test]
    fn test_prefixed_model_sets_provider() {
        let options = stage("ollama")
            .process(input(ChatCompletionOptions {
                model: Some("anthropic:claude-3-haiku".to_string()),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(options.provider.as_deref(), Some("anthropic"));
        assert_eq!(options.model.as_deref(), Some("claude-3-haiku"));
    }

    #[test]
    fn test_bare_model_keeps_selected_provider_for_completion() {
        let options = stage("ollama")
            .process(input(ChatCompletionOptions {
                model: Some("llama3:8b".to_string()),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(options.provider, None);
        assert_eq!(options.model.as_deref(), Some("llama3:8b"));
    }

    #[test]
    fn test_default_model_from_selected_provider() {
        let options = stage("minimax")
            .process(input(ChatCompletionOptions::default()))
            .unwrap();
        assert_eq!(options.provider.as_deref(), Some("minimax"));
        assert_eq!(options.model.as_deref(), Some("MiniMax-M2.1"));
    }

    #[test]
    fn test_no_selected_provider_is_configuration_error() {
        let err = stage("")
            .process(input(ChatCompletionOptions::default()))
            .unwrap_err();
        assert!(matches!(err, StageError::Configuration(ref m) if m.contains("No AI provider")));
    }

    #[test]
    fn test_unknown_provider_without_default_model() {
        let err = stage("gemini")
            .process(input(ChatCompletionOptions::default()))
            .unwrap_err();
        assert!(matches!(err, StageError::Configuration(ref m) if m.contains("gemini")));
    }

    #[test]
    fn test_tools_enabled_by_default_and_attached() {
        let options = stage("ollama")
            .process(input(ChatCompletionOptions::default()))
            .unwrap();
        assert_eq!(options.enable_tools, Some(true));
        assert_eq!(options.tools.len(), 7);

        let options = stage("ollama")
            .process(input(ChatCompletionOptions {
                enable_tools: Some(false),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(options.enable_tools, Some(false));
        assert!(options.tools.is_empty());
    }

    #[test]
    fn test_complexity_estimate() {
        assert_eq!(estimate_complexity(None, 0), QueryComplexity::Low);
        assert_eq!(estimate_complexity(Some("list my notes"), 0), QueryComplexity::Low);
        assert_eq!(
            estimate_complexity(Some("explain this note"), 0),
            QueryComplexity::Medium
        );
        assert_eq!(
            estimate_complexity(Some("what? and why?"), 0),
            QueryComplexity::High
        );
        let long = format!("please explain {}", "x".repeat(120));
        assert_eq!(estimate_complexity(Some(&long), 0), QueryComplexity::High);
        assert_eq!(estimate_complexity(Some("hi"), 6_000), QueryComplexity::Medium);
        assert_eq!(estimate_complexity(Some("hi"), 20_000), QueryComplexity::High);
    }
}
